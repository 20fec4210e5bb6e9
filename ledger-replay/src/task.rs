//! A replay task: rebuilds a range of ledgers, one delta at a time.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    config::Config,
    delta::LedgerDeltaAcquire,
    ledger::{Hash, Ledger, Reason},
    replayer::LedgerReplayer,
    service_traits::{JobQueue, Services},
    skip_list::{SkipListAcquire, SkipListData},
    timeout_counter::{set_timer, AcquireStatus, Retryable, TimeoutCounter},
};

mod parameter;

pub use parameter::TaskParameter;

/// The progress of a [`LedgerReplayTask`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    /// Waiting for the skip list that defines the range.
    AcquiringSkipList,
    /// Acquiring and rebuilding the ledgers in the range.
    BuildingDeltas,
    /// Every ledger in the range has been rebuilt.
    Complete,
    /// The task failed or was cancelled.
    Failed,
}

/// What happened to a sub-task.
#[derive(Clone, Debug)]
pub(crate) enum SubTaskEvent {
    /// A skip list arrived.
    SkipList {
        hash: Hash,
        data: Arc<SkipListData>,
    },
    /// A delta is ready to build.
    DeltaReady(Hash),
    /// A sub-task failed.
    Failed(Hash),
}

/// An event for the tasks attached to a sub-task.
///
/// Sub-tasks create notifications while locked, and deliver them after unlocking.
#[derive(Debug)]
#[must_use = "notifications must be delivered"]
pub(crate) struct Notification {
    tasks: Vec<Weak<LedgerReplayTask>>,
    event: SubTaskEvent,
}

impl Notification {
    pub fn new(tasks: Vec<Weak<LedgerReplayTask>>, event: SubTaskEvent) -> Self {
        Self { tasks, event }
    }

    /// Tells every live task about the event.
    pub fn deliver(self) {
        for task in self.tasks.iter().filter_map(Weak::upgrade) {
            match &self.event {
                SubTaskEvent::SkipList { hash, data } => {
                    task.update_skip_list(*hash, data.ledger_seq, &data.skip_list)
                }
                SubTaskEvent::DeltaReady(hash) => task.delta_ready(*hash),
                SubTaskEvent::Failed(hash) => {
                    tracing::debug!(task = ?task.hash(), sub_task = ?hash, "sub-task failed");
                    task.cancel();
                }
            }
        }
    }
}

/// Replays a range of ledgers ending at a target ledger.
///
/// The task acquires the skip list of the target ledger to learn the hashes
/// in the range, then builds each ledger on top of the one before it,
/// strictly in order.
pub struct LedgerReplayTask {
    hash: Hash,
    reason: Reason,
    services: Services,
    replayer: Weak<LedgerReplayer>,
    skip_list: Arc<SkipListAcquire>,
    state: Mutex<TaskState>,
}

pub(crate) struct TaskState {
    counter: TimeoutCounter,
    parameter: TaskParameter,
    deltas: Vec<Arc<LedgerDeltaAcquire>>,
    /// The index of the next delta to build.
    delta_to_build: usize,
    /// The last ledger built, starting with the first ledger in the range.
    parent: Option<Arc<Ledger>>,
}

impl std::fmt::Debug for LedgerReplayTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerReplayTask")
            .field("hash", &self.hash)
            .field("reason", &self.reason)
            .field("status", &self.status())
            .finish()
    }
}

impl LedgerReplayTask {
    pub(crate) fn new(
        config: &Config,
        services: Services,
        replayer: Weak<LedgerReplayer>,
        parameter: TaskParameter,
        skip_list: Arc<SkipListAcquire>,
    ) -> Arc<Self> {
        let hash = parameter.finish_hash();
        let counter = TimeoutCounter::new(
            hash,
            config.task_timeout,
            config.task_max_timeouts(parameter.total_ledgers()),
            config.max_queued_tasks,
        );

        Arc::new(Self {
            hash,
            reason: parameter.reason(),
            services,
            replayer,
            skip_list,
            state: Mutex::new(TaskState {
                counter,
                parameter,
                deltas: Vec::new(),
                delta_to_build: 0,
                parent: None,
            }),
        })
    }

    /// The hash of the last ledger in the range.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Why the ledgers are being replayed.
    pub fn reason(&self) -> Reason {
        self.reason
    }

    /// A copy of the task's range.
    pub fn parameter(&self) -> TaskParameter {
        self.lock().parameter.clone()
    }

    /// The task's progress.
    pub fn status(&self) -> TaskStatus {
        let state = self.lock();
        match state.counter.status() {
            AcquireStatus::Complete => TaskStatus::Complete,
            AcquireStatus::Failed => TaskStatus::Failed,
            AcquireStatus::Pending if state.parameter.is_full() => TaskStatus::BuildingDeltas,
            AcquireStatus::Pending => TaskStatus::AcquiringSkipList,
        }
    }

    /// Returns `true` if the task has completed or failed.
    pub fn is_finished(&self) -> bool {
        self.lock().counter.is_done()
    }

    /// The number of deltas built so far.
    pub fn delta_to_build(&self) -> usize {
        self.lock().delta_to_build
    }

    /// The number of deltas attached to the task.
    pub fn delta_count(&self) -> usize {
        self.lock().deltas.len()
    }

    /// The most recently built ledger.
    pub fn parent(&self) -> Option<Arc<Ledger>> {
        self.lock().parent.clone()
    }

    /// Returns `true` if this task will replay every ledger `parameter` asks for.
    pub(crate) fn can_merge(&self, parameter: &TaskParameter) -> bool {
        let state = self.lock();
        !state.counter.is_failed() && parameter.can_merge_into(&state.parameter)
    }

    /// Starts the task.
    ///
    /// The task's skip list acquisition must already be started.
    pub(crate) fn init(self: &Arc<Self>) {
        tracing::debug!(hash = ?self.hash, reason = ?self.reason, "starting replay task");

        if !self.skip_list.add_task(self) {
            return;
        }

        let mut state = self.lock();
        if !state.counter.is_done() {
            self.trigger(&mut state);
            set_timer(self, &state.counter);
        }
    }

    /// Fills in the task's range from the skip list, then creates its deltas.
    pub(crate) fn update_skip_list(self: &Arc<Self>, hash: Hash, seq: u32, skip_list: &[Hash]) {
        {
            let mut state = self.lock();
            if state.counter.is_done() {
                return;
            }

            if !state.parameter.update(hash, seq, skip_list) {
                tracing::warn!(
                    hash = ?self.hash,
                    seq,
                    len = skip_list.len(),
                    total = state.parameter.total_ledgers(),
                    "skip list does not cover the replay range",
                );
                self.fail(&mut state);
                return;
            }
        }

        if let Some(replayer) = self.replayer.upgrade() {
            replayer.create_deltas(self);
        }

        let mut state = self.lock();
        self.trigger(&mut state);
    }

    /// Appends the next delta in the range.
    pub(crate) fn add_delta(&self, delta: Arc<LedgerDeltaAcquire>) {
        let mut state = self.lock();
        if state.counter.is_done() {
            return;
        }

        if let Some(last) = state.deltas.last() {
            if last.seq() + 1 != delta.seq() {
                debug_assert!(
                    false,
                    "replay deltas must be added in ledger order: last {}, new {}",
                    last.seq(),
                    delta.seq(),
                );
                tracing::error!(
                    hash = ?self.hash,
                    last = last.seq(),
                    new = delta.seq(),
                    "replay delta out of order",
                );
                self.fail(&mut state);
                return;
            }
        }

        state.deltas.push(delta);
    }

    /// Builds as many deltas as possible after a delta becomes ready.
    pub(crate) fn delta_ready(&self, hash: Hash) {
        tracing::trace!(task = ?self.hash, delta = ?hash, "replay delta ready");

        let mut state = self.lock();
        if !state.counter.is_done() {
            self.try_advance(&mut state);
        }
    }

    /// Stops the task.
    pub(crate) fn cancel(&self) {
        let mut state = self.lock();
        if !state.counter.is_done() {
            self.fail(&mut state);
        }
    }

    fn trigger(&self, state: &mut TaskState) {
        if state.counter.is_done() || !state.parameter.is_full() {
            return;
        }

        if state.parent.is_none() {
            let start_hash = state.parameter.start_hash();
            let start_seq = state.parameter.start_seq();

            state.parent = self
                .services
                .store
                .ledger_by_hash(start_hash)
                .or_else(|| {
                    self.services
                        .inbound
                        .acquire(start_hash, start_seq, Reason::Generic)
                });

            if state.parent.is_some() {
                tracing::debug!(hash = ?self.hash, ?start_hash, start_seq, "found first ledger of replay range");
            }
        }

        self.try_advance(state);
    }

    fn try_advance(&self, state: &mut TaskState) {
        let Some(mut parent) = state.parent.clone() else {
            return;
        };

        while state.delta_to_build < state.deltas.len() {
            let delta = &state.deltas[state.delta_to_build];
            match delta.try_build(&parent) {
                Ok(Some(ledger)) => {
                    parent = ledger;
                    state.delta_to_build += 1;
                    state.parent = Some(parent.clone());
                    state.counter.make_progress();
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(hash = ?self.hash, %error, "replay task failed");
                    self.fail(state);
                    return;
                }
            }
        }

        if parent.seq() == state.parameter.finish_seq() {
            debug_assert_eq!(parent.hash(), self.hash);
            debug_assert_eq!(
                state.delta_to_build as u32 + 1,
                state.parameter.total_ledgers(),
            );

            tracing::info!(
                hash = ?self.hash,
                seq = parent.seq(),
                total = state.parameter.total_ledgers(),
                "replay task completed",
            );
            metrics::counter!("ledger_replay.task.completed", 1);
            state.counter.mark_complete();
        }
    }

    fn fail(&self, state: &mut TaskState) {
        metrics::counter!("ledger_replay.task.failed", 1);
        state.counter.mark_failed();
    }
}

impl Retryable for LedgerReplayTask {
    type State = TaskState;

    const JOB_NAME: &'static str = "LedgerReplayTimeout";

    fn state(&self) -> &Mutex<TaskState> {
        &self.state
    }

    fn counter(state: &mut TaskState) -> &mut TimeoutCounter {
        &mut state.counter
    }

    fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.services.jobs
    }

    fn on_timer(
        self: &Arc<Self>,
        state: &mut TaskState,
        _progress: bool,
    ) -> Option<Notification> {
        if state.counter.is_exhausted() {
            tracing::warn!(
                hash = ?self.hash,
                timeouts = state.counter.timeouts(),
                "replay task timed out",
            );
            self.fail(state);
            return None;
        }

        self.trigger(state);
        None
    }
}
