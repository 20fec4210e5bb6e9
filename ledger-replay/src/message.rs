//! Ledger replay protocol messages.

use serde::{Deserialize, Serialize};

use crate::ledger::{Hash, LedgerHeader, Transaction};

/// A ledger replay request sent to a peer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Ask for the header and skip list of a ledger.
    SkipList {
        /// The ledger holding the skip list.
        ledger_hash: Hash,
    },

    /// Ask for the header and ordered transactions of a ledger.
    ReplayDelta {
        /// The ledger to rebuild.
        ledger_hash: Hash,
    },
}

impl Request {
    /// The ledger the request is about.
    pub fn ledger_hash(&self) -> Hash {
        match self {
            Request::SkipList { ledger_hash } | Request::ReplayDelta { ledger_hash } => *ledger_hash,
        }
    }
}

/// An error code in a replay response.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReplyError {
    /// The peer doesn't have the ledger.
    NoLedger,
    /// The peer has the ledger, but not the requested item.
    NoNode,
    /// The request was malformed.
    BadRequest,
    /// The peer doesn't serve replay requests.
    Disabled,
}

/// A response to [`Request::SkipList`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SkipListResponse {
    /// The requested ledger.
    pub ledger_hash: Hash,
    /// The ledger's header.
    pub header: Option<LedgerHeader>,
    /// The serialized skip list, see [`encode_skip_list`](crate::ledger::encode_skip_list).
    pub item: Vec<u8>,
    /// Set if the peer could not answer.
    pub error: Option<ReplyError>,
}

impl SkipListResponse {
    /// Returns an error response for `ledger_hash`.
    pub fn error(ledger_hash: Hash, error: ReplyError) -> Self {
        Self {
            ledger_hash,
            header: None,
            item: Vec::new(),
            error: Some(error),
        }
    }
}

/// A response to [`Request::ReplayDelta`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplayDeltaResponse {
    /// The requested ledger.
    pub ledger_hash: Hash,
    /// The ledger's header.
    pub header: Option<LedgerHeader>,
    /// The ledger's transactions with their indexes.
    pub transactions: Vec<(u32, Transaction)>,
    /// Set if the peer could not answer.
    pub error: Option<ReplyError>,
}

impl ReplayDeltaResponse {
    /// Returns an error response for `ledger_hash`.
    pub fn error(ledger_hash: Hash, error: ReplyError) -> Self {
        Self {
            ledger_hash,
            header: None,
            transactions: Vec::new(),
            error: Some(error),
        }
    }
}
