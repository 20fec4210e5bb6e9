//! Acquires one ledger's header and transactions, and rebuilds the ledger.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, Weak},
};

use crate::{
    config::Config,
    error::ReplayError,
    ledger::{Hash, Ledger, LedgerHeader, OrderedTransactions, Reason},
    message::Request,
    peer_set::{Fallback, PeerSet},
    replayer::LedgerReplayer,
    service_traits::{ApplyFlags, JobQueue, LedgerReplay, LedgerStore, Services},
    task::{LedgerReplayTask, Notification, SubTaskEvent},
    timeout_counter::{set_timer, AcquireStatus, Retryable, TimeoutCounter},
};

/// The progress of a [`LedgerDeltaAcquire`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeltaStatus {
    /// Waiting for the header and transactions.
    Pending,
    /// The header and transactions have arrived, waiting for the parent ledger.
    HeaderReady,
    /// The ledger has been rebuilt and verified, or was found locally.
    Built,
    /// The acquisition or the build failed.
    Failed,
}

/// Something done with a rebuilt ledger, depending on why it was acquired.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum StoreAction {
    StoreLedger,
    SetShardStored,
    OnLedgerFetched,
}

impl StoreAction {
    fn for_reason(reason: Reason) -> &'static [StoreAction] {
        match reason {
            Reason::Generic | Reason::Consensus => &[StoreAction::StoreLedger],
            Reason::History => &[StoreAction::OnLedgerFetched],
            Reason::Shard => &[StoreAction::SetShardStored, StoreAction::OnLedgerFetched],
        }
    }

    fn run(self, store: &dyn LedgerStore, ledger: &Arc<Ledger>) {
        match self {
            StoreAction::StoreLedger => store.store_ledger(ledger.clone()),
            StoreAction::SetShardStored => store.set_shard_stored(ledger),
            StoreAction::OnLedgerFetched => store.on_ledger_fetched(ledger),
        }
    }
}

/// Acquires the header and ordered transactions of one ledger, then replays
/// them on top of the parent ledger.
///
/// Shared by every task whose range contains the ledger.
pub struct LedgerDeltaAcquire {
    hash: Hash,
    seq: u32,
    config: Arc<Config>,
    services: Services,
    peer_set: Box<dyn PeerSet>,
    replayer: Weak<LedgerReplayer>,
    state: Mutex<DeltaState>,
}

pub(crate) struct DeltaState {
    counter: TimeoutCounter,
    header: Option<LedgerHeader>,
    transactions: OrderedTransactions,
    ledger: Option<Arc<Ledger>>,
    /// Set if the ledger was found locally, rather than rebuilt.
    local: bool,
    reasons: BTreeSet<Reason>,
    performed: BTreeSet<StoreAction>,
    tasks: Vec<Weak<LedgerReplayTask>>,
    fallback: Fallback,
}

impl std::fmt::Debug for LedgerDeltaAcquire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerDeltaAcquire")
            .field("hash", &self.hash)
            .field("seq", &self.seq)
            .field("status", &self.status())
            .finish()
    }
}

impl LedgerDeltaAcquire {
    pub(crate) fn new(
        hash: Hash,
        seq: u32,
        config: Arc<Config>,
        services: Services,
        peer_set: Box<dyn PeerSet>,
        replayer: Weak<LedgerReplayer>,
    ) -> Arc<Self> {
        let counter = TimeoutCounter::new(
            hash,
            config.sub_task_timeout,
            config.sub_task_max_timeouts,
            config.max_queued_tasks,
        );

        Arc::new(Self {
            hash,
            seq,
            config,
            services,
            peer_set,
            replayer,
            state: Mutex::new(DeltaState {
                counter,
                header: None,
                transactions: OrderedTransactions::new(),
                ledger: None,
                local: false,
                reasons: BTreeSet::new(),
                performed: BTreeSet::new(),
                tasks: Vec::new(),
                fallback: Fallback::default(),
            }),
        })
    }

    /// The hash of the ledger being rebuilt.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The sequence number of the ledger being rebuilt.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// The acquisition status.
    pub fn status(&self) -> DeltaStatus {
        let state = self.lock();
        match state.counter.status() {
            AcquireStatus::Pending => DeltaStatus::Pending,
            AcquireStatus::Failed => DeltaStatus::Failed,
            AcquireStatus::Complete if state.ledger.is_some() => DeltaStatus::Built,
            AcquireStatus::Complete => DeltaStatus::HeaderReady,
        }
    }

    /// The reasons of the tasks that have used this delta.
    pub fn reasons(&self) -> Vec<Reason> {
        self.lock().reasons.iter().copied().collect()
    }

    /// Starts the acquisition, asking up to `num_peers` peers.
    pub(crate) fn init(self: &Arc<Self>, num_peers: usize) {
        let notification = {
            let mut state = self.lock();
            let notification = self.trigger(&mut state, num_peers);
            set_timer(self, &state.counter);
            notification
        };

        if let Some(notification) = notification {
            notification.deliver();
        }
    }

    /// Processes a verified header and transaction set from a peer.
    pub(crate) fn process_data(&self, header: LedgerHeader, transactions: OrderedTransactions) {
        let notification = {
            let mut state = self.lock();
            if state.counter.is_done() {
                return;
            }

            if header.seq != self.seq || header.hash() != self.hash {
                tracing::warn!(
                    hash = ?self.hash,
                    seq = self.seq,
                    header_seq = header.seq,
                    "replay delta header does not match the requested ledger",
                );
                self.fail(&mut state)
            } else {
                tracing::trace!(hash = ?self.hash, txs = transactions.len(), "replay delta ready");
                state.header = Some(header);
                state.transactions = transactions;
                state.counter.mark_complete();
                self.ready(&state)
            }
        };

        notification.deliver();
    }

    /// Attaches a task, and records its reason.
    ///
    /// If the ledger has already been rebuilt, a new reason's store actions run now.
    /// The task is told straight away if the delta is already ready or has failed.
    pub(crate) fn add_task(&self, task: &Arc<LedgerReplayTask>) {
        let status = {
            let mut state = self.lock();
            state.tasks.push(Arc::downgrade(task));

            let reason = task.reason();
            if state.reasons.insert(reason) && !state.local {
                if let Some(ledger) = state.ledger.clone() {
                    let actions = Self::take_store_actions(&mut state, [reason]);
                    self.queue_store_job(ledger, actions, false);
                }
            }

            state.counter.status()
        };

        match status {
            AcquireStatus::Pending => {}
            AcquireStatus::Complete => task.delta_ready(self.hash),
            AcquireStatus::Failed => task.cancel(),
        }
    }

    /// Rebuilds the ledger on top of `parent`, if the delta is ready.
    ///
    /// Returns the ledger once built, `None` if the data hasn't arrived yet,
    /// or an error if the delta failed. A built ledger is cached, so later
    /// calls return it without replaying again.
    ///
    /// The caller must hold its task lock, so other tasks are told about a
    /// build failure from a separate job.
    pub(crate) fn try_build(&self, parent: &Arc<Ledger>) -> Result<Option<Arc<Ledger>>, ReplayError> {
        let mut state = self.lock();

        if let Some(ledger) = &state.ledger {
            return Ok(Some(ledger.clone()));
        }

        match state.counter.status() {
            AcquireStatus::Failed => return Err(ReplayError::SubTaskFailed(self.hash)),
            AcquireStatus::Pending => return Ok(None),
            AcquireStatus::Complete => {}
        }

        let Some(header) = state.header.clone() else {
            return Err(self.fail_build(&mut state, ReplayError::SubTaskFailed(self.hash)));
        };

        debug_assert_eq!(
            parent.seq() + 1,
            self.seq,
            "replay deltas must be built on top of the previous ledger",
        );

        if parent.hash() != header.parent_hash {
            let error = ReplayError::ParentMismatch {
                hash: self.hash,
                expected_parent: header.parent_hash,
                parent: parent.hash(),
            };
            return Err(self.fail_build(&mut state, error));
        }

        let replay = LedgerReplay {
            parent: parent.clone(),
            header,
            transactions: std::mem::take(&mut state.transactions),
        };

        let ledger = match self
            .services
            .builder
            .build_ledger(&replay, ApplyFlags::empty())
        {
            Some(ledger) if ledger.hash() == self.hash => ledger,
            Some(ledger) => {
                let error = ReplayError::HashMismatch {
                    expected: self.hash,
                    actual: ledger.hash(),
                };
                return Err(self.fail_build(&mut state, error));
            }
            None => return Err(self.fail_build(&mut state, ReplayError::BuildFailed(self.hash))),
        };

        tracing::debug!(hash = ?self.hash, seq = self.seq, "replayed ledger");
        metrics::counter!("ledger_replay.delta.built", 1);

        state.ledger = Some(ledger.clone());
        let reasons: Vec<Reason> = state.reasons.iter().copied().collect();
        let actions = Self::take_store_actions(&mut state, reasons);
        self.queue_store_job(ledger.clone(), actions, true);

        Ok(Some(ledger))
    }

    /// Stops the acquisition without notifying tasks.
    pub(crate) fn cancel(&self) {
        self.lock().counter.cancel();
    }

    fn trigger(&self, state: &mut DeltaState, limit: usize) -> Option<Notification> {
        if let Some(ledger) = self.services.store.ledger_by_hash(self.hash) {
            tracing::trace!(hash = ?self.hash, "found replay delta ledger in local storage");
            return Some(self.on_local_ledger(state, ledger));
        }

        if !state.fallback.is_active()
            && state.fallback.invite_peers(
                self.peer_set.as_ref(),
                limit,
                Request::ReplayDelta {
                    ledger_hash: self.hash,
                },
                self.seq,
                self.config.max_no_feature_peer_count,
            )
        {
            state
                .counter
                .set_interval(self.config.sub_task_fallback_timeout);
        }

        if state.fallback.is_active() {
            if let Some(ledger) = self
                .services
                .inbound
                .acquire(self.hash, self.seq, Reason::Generic)
            {
                return Some(self.on_local_ledger(state, ledger));
            }
        }

        None
    }

    /// Completes the delta with a ledger the node already has.
    ///
    /// Nothing is replayed or stored.
    fn on_local_ledger(&self, state: &mut DeltaState, ledger: Arc<Ledger>) -> Notification {
        state.header = Some(ledger.header().clone());
        state.ledger = Some(ledger);
        state.local = true;
        state.counter.mark_complete();

        self.ready(state)
    }

    fn ready(&self, state: &DeltaState) -> Notification {
        Notification::new(state.tasks.clone(), SubTaskEvent::DeltaReady(self.hash))
    }

    fn fail(&self, state: &mut DeltaState) -> Notification {
        metrics::counter!("ledger_replay.delta.failed", 1);
        state.counter.mark_failed();

        Notification::new(
            std::mem::take(&mut state.tasks),
            SubTaskEvent::Failed(self.hash),
        )
    }

    /// Fails the delta during a build, telling dependent tasks from a job.
    fn fail_build(&self, state: &mut DeltaState, error: ReplayError) -> ReplayError {
        tracing::warn!(hash = ?self.hash, seq = self.seq, %error, "failed to replay ledger");

        let notification = self.fail(state);
        let queued = self
            .services
            .jobs
            .add_job("LedgerReplayDeltaFailed", Box::new(move || notification.deliver()));

        if !queued {
            tracing::warn!(
                hash = ?self.hash,
                "job queue is shutting down, dependent tasks were not told about the failure",
            );
        }

        error
    }

    /// Returns the store actions for `reasons` that haven't run yet, and
    /// marks them as performed.
    ///
    /// Actions are returned in [`StoreAction`] order, whatever the reasons' order.
    fn take_store_actions(
        state: &mut DeltaState,
        reasons: impl IntoIterator<Item = Reason>,
    ) -> Vec<StoreAction> {
        let actions: BTreeSet<StoreAction> = reasons
            .into_iter()
            .flat_map(StoreAction::for_reason)
            .copied()
            .filter(|action| state.performed.insert(*action))
            .collect();

        actions.into_iter().collect()
    }

    fn queue_store_job(&self, ledger: Arc<Ledger>, actions: Vec<StoreAction>, first_build: bool) {
        if actions.is_empty() && !first_build {
            return;
        }

        let store = self.services.store.clone();
        let queued = self.services.jobs.add_job(
            "LedgerReplayStore",
            Box::new(move || {
                for action in actions {
                    action.run(store.as_ref(), &ledger);
                }

                if first_build {
                    store.check_accept(&ledger);
                    store.try_advance();
                }
            }),
        );

        if !queued {
            tracing::warn!(hash = ?self.hash, "job queue is shutting down, replayed ledger was not stored");
        }
    }
}

impl Retryable for LedgerDeltaAcquire {
    type State = DeltaState;

    const JOB_NAME: &'static str = "LedgerDeltaTimeout";

    fn state(&self) -> &Mutex<DeltaState> {
        &self.state
    }

    fn counter(state: &mut DeltaState) -> &mut TimeoutCounter {
        &mut state.counter
    }

    fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.services.jobs
    }

    fn on_timer(
        self: &Arc<Self>,
        state: &mut DeltaState,
        _progress: bool,
    ) -> Option<Notification> {
        if state.counter.is_exhausted() {
            tracing::warn!(
                hash = ?self.hash,
                seq = self.seq,
                timeouts = state.counter.timeouts(),
                "replay delta acquisition timed out",
            );
            return Some(self.fail(state));
        }

        self.trigger(state, 1)
    }
}

impl Drop for LedgerDeltaAcquire {
    fn drop(&mut self) {
        if let Some(replayer) = self.replayer.upgrade() {
            replayer.remove_delta(self.hash);
        }
    }
}
