//! Error types for ledger replay.

use thiserror::Error;

use crate::{ledger::Hash, message::ReplyError};

/// An error deserializing data received from a peer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SerializationError {
    /// The data was structurally invalid.
    #[error("parse error: {0}")]
    Parse(&'static str),
}

/// An error rebuilding a ledger from its parent and a delta.
///
/// All of these are terminal for the delta and for every task that needs it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReplayError {
    /// The delta, or the data it depends on, has already failed.
    #[error("sub-task for ledger {0} failed")]
    SubTaskFailed(Hash),

    /// The parent ledger is not the one the delta's header points to.
    #[error("parent {parent} does not match delta {hash}: expected parent {expected_parent}")]
    ParentMismatch {
        /// The ledger the delta rebuilds.
        hash: Hash,
        /// The parent hash in the delta's header.
        expected_parent: Hash,
        /// The parent ledger that was supplied.
        parent: Hash,
    },

    /// The ledger builder could not apply the transactions.
    #[error("could not replay transactions for ledger {0}")]
    BuildFailed(Hash),

    /// The rebuilt ledger does not have the hash the skip list promised.
    ///
    /// Either a peer supplied bad transactions, or local replay diverged.
    #[error("replayed ledger hash {actual} does not match expected hash {expected}")]
    HashMismatch {
        /// The trusted ledger hash.
        expected: Hash,
        /// The hash of the ledger the builder produced.
        actual: Hash,
    },
}

/// A reason to reject a response from a peer.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ResponseError {
    /// The peer replied with an error.
    #[error("peer replied with an error: {0:?}")]
    Peer(ReplyError),

    /// The response does not include a ledger header.
    #[error("response is missing the ledger header")]
    MissingHeader,

    /// The header doesn't hash to the requested ledger hash.
    #[error("response header hashes to {actual}, but ledger {requested} was requested")]
    WrongLedger {
        /// The ledger hash in the request.
        requested: Hash,
        /// The hash of the header in the response.
        actual: Hash,
    },

    /// The skip list doesn't match the header's skip list root, or doesn't
    /// end with its parent hash.
    #[error("skip list does not match the ledger header")]
    SkipListMismatch,

    /// Two transactions claim the same index.
    #[error("duplicate transaction index {0}")]
    DuplicateIndex(u32),

    /// The transactions don't match the header's transaction root.
    #[error("transactions do not match the header's transaction root")]
    TxRootMismatch,

    /// The response payload could not be deserialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
