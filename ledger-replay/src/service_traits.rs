//! Interfaces to the rest of the node.
//!
//! Ledger replay doesn't own ledger storage, transaction execution, peer
//! connections, or worker threads. It reaches them through these traits, so
//! the node can plug in its own implementations and tests can use the
//! deterministic ones in [`mock`](crate::mock).

use std::{sync::Arc, time::Duration};

use bitflags::bitflags;

use crate::{
    ledger::{Hash, Ledger, LedgerHeader, OrderedTransactions, Reason},
    message::Request,
};

/// Access to the node's validated ledgers.
pub trait LedgerStore: Send + Sync {
    /// Returns the ledger with `hash`, if the node has it.
    fn ledger_by_hash(&self, hash: Hash) -> Option<Arc<Ledger>>;

    /// Stores a replayed ledger as part of the node's chain.
    fn store_ledger(&self, ledger: Arc<Ledger>);

    /// Offers a newly built ledger for acceptance as the validated ledger.
    fn check_accept(&self, ledger: &Arc<Ledger>);

    /// Lets the node advance its validated ledger, if it can.
    fn try_advance(&self);

    /// Records a backfilled historical ledger.
    fn on_ledger_fetched(&self, ledger: &Arc<Ledger>);

    /// Records a ledger in its shard.
    fn set_shard_stored(&self, ledger: &Arc<Ledger>);
}

bitflags! {
    /// Flags passed to the transaction engine when replaying a ledger.
    ///
    /// Replay uses no flags: transactions from peers are always fully checked.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct ApplyFlags: u32 {
        /// Skip signature checks.
        const NO_CHECK_SIGN = 1 << 0;
    }
}

/// Everything needed to replay one ledger on top of its parent.
#[derive(Clone, Debug)]
pub struct LedgerReplay {
    /// The previous ledger.
    pub parent: Arc<Ledger>,
    /// The header of the ledger being rebuilt.
    pub header: LedgerHeader,
    /// The ledger's transactions, in application order.
    pub transactions: OrderedTransactions,
}

/// The transaction engine.
pub trait LedgerBuilder: Send + Sync {
    /// Applies `replay.transactions` to `replay.parent`, returning the new ledger.
    ///
    /// Returns `None` if the transactions could not be applied.
    /// The caller checks the returned ledger's hash.
    fn build_ledger(&self, replay: &LedgerReplay, flags: ApplyFlags) -> Option<Arc<Ledger>>;
}

/// Whole-ledger acquisition, used when peers don't support replay.
pub trait InboundLedgers: Send + Sync {
    /// Starts or continues acquiring a whole ledger.
    ///
    /// Returns the ledger if it has already been acquired.
    fn acquire(&self, hash: Hash, seq: u32, reason: Reason) -> Option<Arc<Ledger>>;
}

/// A peer's overlay identifier.
pub type PeerId = u64;

/// A connected peer.
pub trait Peer: Send + Sync {
    /// The peer's identifier.
    fn id(&self) -> PeerId;

    /// Returns `true` if the peer negotiated the ledger replay protocol feature.
    fn supports_ledger_replay(&self) -> bool;

    /// Returns `true` if the peer claims to have the ledger.
    ///
    /// A `seq` of zero means the sequence is unknown.
    fn has_ledger(&self, hash: Hash, seq: u32) -> bool;

    /// The peer's ranking score. Higher is better.
    fn score(&self, has_item: bool) -> i32;

    /// Sends a request to the peer.
    fn send(&self, request: Request);
}

/// The set of connected peers.
pub trait Overlay: Send + Sync {
    /// Returns a snapshot of the connected peers.
    fn peers(&self) -> Vec<Arc<dyn Peer>>;

    /// Returns the peer with `id`, if it is still connected.
    fn find_peer(&self, id: PeerId) -> Option<Arc<dyn Peer>>;
}

/// A unit of work for a [`JobQueue`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The node's job scheduler.
pub trait JobQueue: Send + Sync {
    /// Queues `job` to run on a worker.
    ///
    /// Returns `false` if the queue is shutting down and the job was dropped.
    fn add_job(&self, name: &'static str, job: Job) -> bool;

    /// The number of queued or running jobs.
    fn job_count(&self) -> usize;

    /// Calls `on_expire` once `delay` has passed.
    ///
    /// `on_expire` must be cheap: it runs on the timer thread.
    fn schedule(&self, delay: Duration, on_expire: Job);
}

/// The collaborators shared by every replay object.
#[derive(Clone)]
pub struct Services {
    /// Ledger storage.
    pub store: Arc<dyn LedgerStore>,
    /// The transaction engine.
    pub builder: Arc<dyn LedgerBuilder>,
    /// The whole-ledger fallback.
    pub inbound: Arc<dyn InboundLedgers>,
    /// The job scheduler.
    pub jobs: Arc<dyn JobQueue>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish_non_exhaustive()
    }
}
