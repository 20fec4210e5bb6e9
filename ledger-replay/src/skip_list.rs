//! Acquires the skip list held by a replay task's target ledger.

use std::sync::{Arc, Mutex, Weak};

use crate::{
    config::Config,
    ledger::{decode_skip_list, Hash, Ledger, Reason},
    message::Request,
    peer_set::{Fallback, PeerSet},
    replayer::LedgerReplayer,
    service_traits::{JobQueue, Services},
    task::{LedgerReplayTask, Notification, SubTaskEvent},
    timeout_counter::{set_timer, AcquireStatus, Retryable, TimeoutCounter},
};

/// An acquired skip list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkipListData {
    /// The sequence number of the ledger holding the list.
    pub ledger_seq: u32,
    /// The hashes of the preceding ledgers, oldest first.
    pub skip_list: Vec<Hash>,
}

/// Acquires the skip list stored in one ledger.
///
/// Shared by every task that targets that ledger.
pub struct SkipListAcquire {
    hash: Hash,
    config: Arc<Config>,
    services: Services,
    peer_set: Box<dyn PeerSet>,
    replayer: Weak<LedgerReplayer>,
    state: Mutex<SkipListState>,
}

pub(crate) struct SkipListState {
    counter: TimeoutCounter,
    data: Option<Arc<SkipListData>>,
    tasks: Vec<Weak<LedgerReplayTask>>,
    fallback: Fallback,
}

impl std::fmt::Debug for SkipListAcquire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipListAcquire")
            .field("hash", &self.hash)
            .field("status", &self.status())
            .finish()
    }
}

impl SkipListAcquire {
    pub(crate) fn new(
        hash: Hash,
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
            config,
            services,
            peer_set,
            replayer,
            state: Mutex::new(SkipListState {
                counter,
                data: None,
                tasks: Vec::new(),
                fallback: Fallback::default(),
            }),
        })
    }

    /// The hash of the ledger holding the skip list.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The acquisition status.
    pub fn status(&self) -> AcquireStatus {
        self.lock().counter.status()
    }

    /// The skip list, once acquired.
    pub fn data(&self) -> Option<Arc<SkipListData>> {
        self.lock().data.clone()
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

    /// Processes a verified skip list item from a peer.
    ///
    /// An empty list leaves the acquisition waiting for another peer.
    pub(crate) fn process_data(&self, ledger_seq: u32, item: &[u8]) {
        let notification = {
            let mut state = self.lock();
            if state.counter.is_done() {
                return;
            }

            match decode_skip_list(item) {
                Ok(skip_list) if skip_list.is_empty() => {
                    tracing::debug!(hash = ?self.hash, "peer sent an empty skip list");
                    return;
                }
                Ok(skip_list) => self.on_skip_list(&mut state, ledger_seq, skip_list),
                Err(error) => {
                    tracing::warn!(hash = ?self.hash, ?error, "peer sent an invalid skip list");
                    self.fail(&mut state)
                }
            }
        };

        notification.deliver();
    }

    /// Attaches a task, which is told when the skip list arrives or the
    /// acquisition fails.
    ///
    /// Returns `false` if the acquisition has already failed, after cancelling the task.
    pub(crate) fn add_task(&self, task: &Arc<LedgerReplayTask>) -> bool {
        let data = {
            let mut state = self.lock();
            match state.counter.status() {
                AcquireStatus::Pending => {
                    state.tasks.push(Arc::downgrade(task));
                    return true;
                }
                AcquireStatus::Complete => state.data.clone(),
                AcquireStatus::Failed => None,
            }
        };

        match data {
            Some(data) => {
                task.update_skip_list(self.hash, data.ledger_seq, &data.skip_list);
                true
            }
            None => {
                task.cancel();
                false
            }
        }
    }

    /// Stops the acquisition without notifying tasks.
    pub(crate) fn cancel(&self) {
        self.lock().counter.cancel();
    }

    fn trigger(&self, state: &mut SkipListState, limit: usize) -> Option<Notification> {
        if let Some(ledger) = self.services.store.ledger_by_hash(self.hash) {
            tracing::trace!(hash = ?self.hash, "found skip list ledger in local storage");
            return Some(self.on_ledger(state, &ledger));
        }

        if !state.fallback.is_active()
            && state.fallback.invite_peers(
                self.peer_set.as_ref(),
                limit,
                Request::SkipList {
                    ledger_hash: self.hash,
                },
                0,
                self.config.max_no_feature_peer_count,
            )
        {
            state
                .counter
                .set_interval(self.config.sub_task_fallback_timeout);
        }

        if state.fallback.is_active() {
            if let Some(ledger) = self.services.inbound.acquire(self.hash, 0, Reason::Generic) {
                return Some(self.on_ledger(state, &ledger));
            }
        }

        None
    }

    fn on_ledger(&self, state: &mut SkipListState, ledger: &Ledger) -> Notification {
        if ledger.skip_list().is_empty() {
            tracing::warn!(hash = ?self.hash, "ledger has an empty skip list");
            return self.fail(state);
        }

        self.on_skip_list(state, ledger.seq(), ledger.skip_list().to_vec())
    }

    fn on_skip_list(&self, state: &mut SkipListState, ledger_seq: u32, skip_list: Vec<Hash>) -> Notification {
        tracing::debug!(hash = ?self.hash, ledger_seq, len = skip_list.len(), "acquired skip list");
        metrics::counter!("ledger_replay.skip_list.acquired", 1);

        let data = Arc::new(SkipListData {
            ledger_seq,
            skip_list,
        });
        state.data = Some(data.clone());
        state.counter.mark_complete();

        Notification::new(
            std::mem::take(&mut state.tasks),
            SubTaskEvent::SkipList {
                hash: self.hash,
                data,
            },
        )
    }

    fn fail(&self, state: &mut SkipListState) -> Notification {
        metrics::counter!("ledger_replay.skip_list.failed", 1);
        state.counter.mark_failed();

        Notification::new(
            std::mem::take(&mut state.tasks),
            SubTaskEvent::Failed(self.hash),
        )
    }
}

impl Retryable for SkipListAcquire {
    type State = SkipListState;

    const JOB_NAME: &'static str = "SkipListTimeout";

    fn state(&self) -> &Mutex<SkipListState> {
        &self.state
    }

    fn counter(state: &mut SkipListState) -> &mut TimeoutCounter {
        &mut state.counter
    }

    fn jobs(&self) -> &Arc<dyn JobQueue> {
        &self.services.jobs
    }

    fn on_timer(
        self: &Arc<Self>,
        state: &mut SkipListState,
        _progress: bool,
    ) -> Option<Notification> {
        if state.counter.is_exhausted() {
            tracing::warn!(
                hash = ?self.hash,
                timeouts = state.counter.timeouts(),
                "skip list acquisition timed out",
            );
            return Some(self.fail(state));
        }

        self.trigger(state, 1)
    }
}

impl Drop for SkipListAcquire {
    fn drop(&mut self) {
        if let Some(replayer) = self.replayer.upgrade() {
            replayer.remove_skip_list(self.hash);
        }
    }
}
