//! Deterministic collaborators for tests.
//!
//! Nothing here runs in the background: jobs and timers only run when a test
//! calls [`ManualJobQueue::run_pending_jobs`] or [`ManualJobQueue::fire_timers`].

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    ledger::{
        skip_list_hash, transaction_root, Hash, Ledger, LedgerHeader, OrderedTransactions,
        Reason, Transaction,
    },
    message::Request,
    service_traits::{
        ApplyFlags, InboundLedgers, Job, JobQueue, LedgerBuilder, LedgerReplay, LedgerStore,
        Overlay, Peer, PeerId, Services,
    },
};

/// A [`JobQueue`] that only runs jobs and timers when asked to.
#[derive(Default)]
pub struct ManualJobQueue {
    jobs: Mutex<VecDeque<(&'static str, Job)>>,
    timers: Mutex<Vec<(Duration, Job)>>,
    busy: AtomicUsize,
    shut_down: AtomicBool,
}

impl ManualJobQueue {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs queued jobs, including jobs they queue, until the queue is empty.
    ///
    /// Returns the number of jobs run.
    pub fn run_pending_jobs(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self
                .jobs
                .lock()
                .expect("mock job queue mutex should be unpoisoned")
                .pop_front();

            match job {
                Some((_name, job)) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Expires every timer armed so far, regardless of its delay.
    ///
    /// Timers armed while expiring wait for the next call.
    /// Returns the number of timers expired.
    pub fn fire_timers(&self) -> usize {
        let timers = std::mem::take(
            &mut *self
                .timers
                .lock()
                .expect("mock timer mutex should be unpoisoned"),
        );

        let count = timers.len();
        for (_delay, on_expire) in timers {
            on_expire();
        }

        count
    }

    /// Expires the armed timers, then runs every job they queued.
    pub fn tick(&self) {
        self.fire_timers();
        self.run_pending_jobs();
    }

    /// The delays of the armed timers.
    pub fn timer_delays(&self) -> Vec<Duration> {
        self.timers
            .lock()
            .expect("mock timer mutex should be unpoisoned")
            .iter()
            .map(|(delay, _)| *delay)
            .collect()
    }

    /// The names of the queued jobs.
    pub fn queued_job_names(&self) -> Vec<&'static str> {
        self.jobs
            .lock()
            .expect("mock job queue mutex should be unpoisoned")
            .iter()
            .map(|(name, _)| *name)
            .collect()
    }

    /// Pretends that `busy` other jobs are running.
    pub fn set_busy(&self, busy: usize) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Drops every job added from now on, the way a stopping node's queue does.
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

impl JobQueue for ManualJobQueue {
    fn add_job(&self, name: &'static str, job: Job) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }

        self.jobs
            .lock()
            .expect("mock job queue mutex should be unpoisoned")
            .push_back((name, job));
        true
    }

    fn job_count(&self) -> usize {
        let queued = self
            .jobs
            .lock()
            .expect("mock job queue mutex should be unpoisoned")
            .len();

        queued + self.busy.load(Ordering::SeqCst)
    }

    fn schedule(&self, delay: Duration, on_expire: Job) {
        self.timers
            .lock()
            .expect("mock timer mutex should be unpoisoned")
            .push((delay, on_expire));
    }
}

/// A call made to a [`MockLedgerStore`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreCall {
    /// [`LedgerStore::store_ledger`]
    StoreLedger(Hash),
    /// [`LedgerStore::check_accept`]
    CheckAccept(Hash),
    /// [`LedgerStore::try_advance`]
    TryAdvance,
    /// [`LedgerStore::on_ledger_fetched`]
    OnLedgerFetched(Hash),
    /// [`LedgerStore::set_shard_stored`]
    SetShardStored(Hash),
}

/// An in-memory [`LedgerStore`] that records the calls made to it.
#[derive(Default)]
pub struct MockLedgerStore {
    ledgers: Mutex<HashMap<Hash, Arc<Ledger>>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl MockLedgerStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a ledger without recording a call.
    pub fn insert(&self, ledger: Arc<Ledger>) {
        self.ledgers
            .lock()
            .expect("mock store mutex should be unpoisoned")
            .insert(ledger.hash(), ledger);
    }

    /// Returns `true` if the store has the ledger.
    pub fn contains(&self, hash: Hash) -> bool {
        self.ledgers
            .lock()
            .expect("mock store mutex should be unpoisoned")
            .contains_key(&hash)
    }

    /// The calls made so far.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls
            .lock()
            .expect("mock store mutex should be unpoisoned")
            .clone()
    }

    fn record(&self, call: StoreCall) {
        self.calls
            .lock()
            .expect("mock store mutex should be unpoisoned")
            .push(call);
    }
}

impl LedgerStore for MockLedgerStore {
    fn ledger_by_hash(&self, hash: Hash) -> Option<Arc<Ledger>> {
        self.ledgers
            .lock()
            .expect("mock store mutex should be unpoisoned")
            .get(&hash)
            .cloned()
    }

    fn store_ledger(&self, ledger: Arc<Ledger>) {
        self.record(StoreCall::StoreLedger(ledger.hash()));
        self.insert(ledger);
    }

    fn check_accept(&self, ledger: &Arc<Ledger>) {
        self.record(StoreCall::CheckAccept(ledger.hash()));
    }

    fn try_advance(&self) {
        self.record(StoreCall::TryAdvance);
    }

    fn on_ledger_fetched(&self, ledger: &Arc<Ledger>) {
        self.record(StoreCall::OnLedgerFetched(ledger.hash()));
    }

    fn set_shard_stored(&self, ledger: &Arc<Ledger>) {
        self.record(StoreCall::SetShardStored(ledger.hash()));
    }
}

/// Returns the first ledger of a test chain.
pub fn genesis_ledger() -> Arc<Ledger> {
    let header = LedgerHeader {
        seq: 1,
        parent_hash: Hash::ZERO,
        tx_hash: Hash::ZERO,
        state_hash: Hash::digest(b"genesis state"),
        skip_list_hash: Hash::ZERO,
        close_time: 0,
    };

    Arc::new(Ledger::new(header, Vec::new(), BTreeMap::new()))
}

/// Applies `transactions` to `parent`, the way the [`MockLedgerBuilder`] does.
///
/// The state root commits to the parent's state and the transaction root.
pub fn next_ledger(parent: &Ledger, transactions: OrderedTransactions, close_time: u64) -> Arc<Ledger> {
    let tx_hash = transaction_root(&transactions);
    let skip_list = parent.child_skip_list();

    let mut state = parent.header().state_hash.0.to_vec();
    state.extend_from_slice(&tx_hash.0);

    let header = LedgerHeader {
        seq: parent.seq() + 1,
        parent_hash: parent.hash(),
        tx_hash,
        state_hash: Hash::digest(state),
        skip_list_hash: skip_list_hash(&skip_list),
        close_time,
    };

    Arc::new(Ledger::new(header, skip_list, transactions))
}

/// Returns a chain of `len` ledgers starting at the genesis ledger.
///
/// Ledgers have between zero and three transactions.
pub fn ledger_chain(len: usize) -> Vec<Arc<Ledger>> {
    let mut chain = Vec::with_capacity(len);
    if len == 0 {
        return chain;
    }

    chain.push(genesis_ledger());
    while chain.len() < len {
        let parent = chain.last().expect("chain is not empty");
        let seq = parent.seq() + 1;

        let transactions = (0..seq % 4)
            .map(|index| {
                let mut bytes = seq.to_le_bytes().to_vec();
                bytes.extend_from_slice(&index.to_le_bytes());
                (index, Arc::new(Transaction::new(bytes)))
            })
            .collect();

        let ledger = next_ledger(parent, transactions, u64::from(seq) * 10);
        chain.push(ledger);
    }

    chain
}

/// A [`LedgerBuilder`] that replays with [`next_ledger`].
#[derive(Default)]
pub struct MockLedgerBuilder {
    corrupt: AtomicBool,
    refuse: AtomicBool,
    builds: AtomicUsize,
    flags: Mutex<Vec<ApplyFlags>>,
}

impl MockLedgerBuilder {
    /// Creates a builder that replays correctly.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the builder produce ledgers with the wrong hash.
    pub fn set_corrupt(&self, corrupt: bool) {
        self.corrupt.store(corrupt, Ordering::SeqCst);
    }

    /// Makes the builder fail to apply transactions.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// The number of ledgers built so far.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// The flags passed to each build, in order.
    pub fn build_flags(&self) -> Vec<ApplyFlags> {
        self.flags
            .lock()
            .expect("mock builder mutex should be unpoisoned")
            .clone()
    }
}

impl LedgerBuilder for MockLedgerBuilder {
    fn build_ledger(&self, replay: &LedgerReplay, flags: ApplyFlags) -> Option<Arc<Ledger>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.flags
            .lock()
            .expect("mock builder mutex should be unpoisoned")
            .push(flags);

        if self.refuse.load(Ordering::SeqCst) {
            return None;
        }

        let mut close_time = replay.header.close_time;
        if self.corrupt.load(Ordering::SeqCst) {
            close_time += 1;
        }

        Some(next_ledger(
            &replay.parent,
            replay.transactions.clone(),
            close_time,
        ))
    }
}

/// An [`InboundLedgers`] that already has some ledgers, and records requests.
#[derive(Default)]
pub struct MockInboundLedgers {
    ledgers: Mutex<HashMap<Hash, Arc<Ledger>>>,
    requests: Mutex<Vec<(Hash, u32, Reason)>>,
}

impl MockInboundLedgers {
    /// Creates an inbound ledger source with no ledgers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `ledger` available to [`InboundLedgers::acquire`].
    pub fn insert(&self, ledger: Arc<Ledger>) {
        self.ledgers
            .lock()
            .expect("mock inbound mutex should be unpoisoned")
            .insert(ledger.hash(), ledger);
    }

    /// The acquisition requests made so far.
    pub fn requests(&self) -> Vec<(Hash, u32, Reason)> {
        self.requests
            .lock()
            .expect("mock inbound mutex should be unpoisoned")
            .clone()
    }
}

impl InboundLedgers for MockInboundLedgers {
    fn acquire(&self, hash: Hash, seq: u32, reason: Reason) -> Option<Arc<Ledger>> {
        self.requests
            .lock()
            .expect("mock inbound mutex should be unpoisoned")
            .push((hash, seq, reason));

        self.ledgers
            .lock()
            .expect("mock inbound mutex should be unpoisoned")
            .get(&hash)
            .cloned()
    }
}

/// A [`Peer`] that records the requests sent to it.
pub struct MockPeer {
    id: PeerId,
    supports_ledger_replay: bool,
    ledgers: HashSet<Hash>,
    sent: Mutex<Vec<Request>>,
}

impl MockPeer {
    /// Creates a peer that has `ledgers`.
    pub fn new<'a>(
        id: PeerId,
        supports_ledger_replay: bool,
        ledgers: impl IntoIterator<Item = &'a Arc<Ledger>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            supports_ledger_replay,
            ledgers: ledgers.into_iter().map(|ledger| ledger.hash()).collect(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Removes and returns the requests sent so far.
    pub fn take_sent(&self) -> Vec<Request> {
        std::mem::take(&mut *self.sent.lock().expect("mock peer mutex should be unpoisoned"))
    }

    /// The number of requests waiting in [`MockPeer::take_sent`].
    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .expect("mock peer mutex should be unpoisoned")
            .len()
    }
}

impl Peer for MockPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn supports_ledger_replay(&self) -> bool {
        self.supports_ledger_replay
    }

    fn has_ledger(&self, hash: Hash, _seq: u32) -> bool {
        self.ledgers.contains(&hash)
    }

    fn score(&self, has_item: bool) -> i32 {
        if has_item {
            100
        } else {
            0
        }
    }

    fn send(&self, request: Request) {
        self.sent
            .lock()
            .expect("mock peer mutex should be unpoisoned")
            .push(request);
    }
}

/// An [`Overlay`] with a fixed set of [`MockPeer`]s.
#[derive(Default)]
pub struct MockOverlay {
    peers: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockOverlay {
    /// Creates an overlay with `peers` connected.
    pub fn new(peers: impl IntoIterator<Item = Arc<MockPeer>>) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(peers.into_iter().collect()),
        })
    }

    /// Disconnects a peer.
    pub fn disconnect(&self, id: PeerId) {
        self.peers
            .lock()
            .expect("mock overlay mutex should be unpoisoned")
            .retain(|peer| peer.id != id);
    }

    /// The connected peers.
    pub fn mock_peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers
            .lock()
            .expect("mock overlay mutex should be unpoisoned")
            .clone()
    }
}

impl Overlay for MockOverlay {
    fn peers(&self) -> Vec<Arc<dyn Peer>> {
        self.mock_peers()
            .into_iter()
            .map(|peer| peer as Arc<dyn Peer>)
            .collect()
    }

    fn find_peer(&self, id: PeerId) -> Option<Arc<dyn Peer>> {
        self.mock_peers()
            .into_iter()
            .find(|peer| peer.id == id)
            .map(|peer| peer as Arc<dyn Peer>)
    }
}

/// Mock collaborators, with typed handles for inspecting them.
#[derive(Clone)]
pub struct MockServices {
    /// The ledger store.
    pub store: Arc<MockLedgerStore>,
    /// The transaction engine.
    pub builder: Arc<MockLedgerBuilder>,
    /// The whole-ledger fallback.
    pub inbound: Arc<MockInboundLedgers>,
    /// The job queue.
    pub jobs: Arc<ManualJobQueue>,
}

impl MockServices {
    /// Creates empty mock collaborators.
    pub fn new() -> Self {
        Self {
            store: MockLedgerStore::new(),
            builder: MockLedgerBuilder::new(),
            inbound: MockInboundLedgers::new(),
            jobs: ManualJobQueue::new(),
        }
    }

    /// Returns the collaborators as trait objects.
    pub fn services(&self) -> Services {
        Services {
            store: self.store.clone(),
            builder: self.builder.clone(),
            inbound: self.inbound.clone(),
            jobs: self.jobs.clone(),
        }
    }
}

impl Default for MockServices {
    fn default() -> Self {
        Self::new()
    }
}
