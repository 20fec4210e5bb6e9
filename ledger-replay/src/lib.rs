//! Ledger replay: rebuild a missing chain of ledgers from peer-supplied deltas.
//!
//! Given the hash of a ledger the node lacks, a [`LedgerReplayer`] fetches
//! the skip list stored in that ledger, derives the hashes of the ledgers in
//! the requested range, fetches each ledger's header and ordered transactions
//! from peers, and replays those transactions on top of the previous ledger.
//! A ledger is only accepted when its replayed hash equals the hash the skip
//! list promised.
//!
//! The ledger state tree, transaction execution, the peer overlay, and the job
//! scheduler are external collaborators, see [`service_traits`].

#![warn(missing_docs)]
#![allow(clippy::try_err)]
#![deny(clippy::await_holding_lock)]
#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
mod delta;
mod error;
pub mod job_queue;
pub mod ledger;
pub mod message;
mod msg_handler;
mod peer_set;
mod replayer;
pub mod service_traits;
mod skip_list;
mod task;
mod timeout_counter;

#[cfg(any(test, feature = "proptest-impl"))]
pub mod mock;


pub use config::Config;
pub use delta::{DeltaStatus, LedgerDeltaAcquire};
pub use error::{ReplayError, ResponseError, SerializationError};
pub use ledger::{Hash, Ledger, LedgerHeader, Reason, Transaction};
pub use msg_handler::ReplayMsgHandler;
pub use peer_set::{OverlayPeerSet, OverlayPeerSetBuilder, PeerSet, PeerSetBuilder};
pub use replayer::LedgerReplayer;
pub use service_traits::Services;
pub use skip_list::{SkipListAcquire, SkipListData};
pub use task::{LedgerReplayTask, TaskParameter, TaskStatus};
pub use timeout_counter::AcquireStatus;
