//! The registry of replay tasks and their shared sub-tasks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tokio::task::JoinHandle;
use tracing::instrument;

use crate::{
    config::Config,
    delta::{DeltaStatus, LedgerDeltaAcquire},
    ledger::{Hash, LedgerHeader, OrderedTransactions, Reason},
    peer_set::PeerSetBuilder,
    service_traits::Services,
    skip_list::SkipListAcquire,
    task::{LedgerReplayTask, TaskParameter},
    timeout_counter::AcquireStatus,
};

/// Accepts replay requests, and routes peer data to the acquisitions that need it.
///
/// Skip list and delta acquisitions are shared between tasks. The replayer
/// only keeps weak references to them, so they live exactly as long as a
/// task uses them.
pub struct LedgerReplayer {
    config: Arc<Config>,
    services: Services,
    peer_set_builder: Arc<dyn PeerSetBuilder>,
    weak_self: Weak<LedgerReplayer>,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    tasks: Vec<Arc<LedgerReplayTask>>,
    skip_lists: HashMap<Hash, Weak<SkipListAcquire>>,
    deltas: HashMap<Hash, Weak<LedgerDeltaAcquire>>,
    stopping: bool,
}

impl std::fmt::Debug for LedgerReplayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        f.debug_struct("LedgerReplayer")
            .field("tasks", &registry.tasks.len())
            .field("skip_lists", &registry.skip_lists.len())
            .field("deltas", &registry.deltas.len())
            .field("stopping", &registry.stopping)
            .finish()
    }
}

impl LedgerReplayer {
    /// Creates a replayer.
    pub fn new(
        config: Config,
        services: Services,
        peer_set_builder: Arc<dyn PeerSetBuilder>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config: Arc::new(config),
            services,
            peer_set_builder,
            weak_self: weak_self.clone(),
            registry: Mutex::new(Registry::default()),
        })
    }

    /// The replayer's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replays `total_ledgers` ledgers, ending at `finish_hash`.
    ///
    /// Invalid requests, requests over the task limit, and requests that an
    /// existing task already covers are logged and dropped.
    #[instrument(skip(self))]
    pub fn replay(&self, reason: Reason, finish_hash: Hash, total_ledgers: u32) {
        if !self.config.enable {
            tracing::debug!("ledger replay is disabled, dropping request");
            return;
        }

        if finish_hash.is_zero() || total_ledgers == 0 || total_ledgers > self.config.max_task_size
        {
            tracing::info!(max = self.config.max_task_size, "invalid replay request");
            metrics::counter!("ledger_replay.task.dropped", 1);
            return;
        }

        let parameter = TaskParameter::new(reason, finish_hash, total_ledgers);

        // A replaced acquisition can be dropped here, so it must outlive the registry lock.
        let mut failed_skip_list = None;
        let (task, skip_list, new_skip_list) = {
            let mut registry = self.registry();

            if registry.stopping {
                tracing::debug!("ledger replayer is stopping, dropping request");
                return;
            }

            if registry.tasks.len() >= self.config.max_tasks {
                tracing::info!(
                    tasks = registry.tasks.len(),
                    "too many replay tasks, dropping request",
                );
                metrics::counter!("ledger_replay.task.dropped", 1);
                return;
            }

            if registry.tasks.iter().any(|task| task.can_merge(&parameter)) {
                tracing::info!("replay request merged into an existing task");
                metrics::counter!("ledger_replay.task.merged", 1);
                return;
            }

            let cached = registry
                .skip_lists
                .get(&finish_hash)
                .and_then(Weak::upgrade);
            let (skip_list, new_skip_list) = match cached {
                Some(skip_list) if skip_list.status() != AcquireStatus::Failed => {
                    (skip_list, false)
                }
                cached => {
                    if cached.is_some() {
                        tracing::debug!(hash = ?finish_hash, "replacing failed skip list acquisition");
                    }
                    failed_skip_list = cached;

                    let skip_list = SkipListAcquire::new(
                        finish_hash,
                        self.config.clone(),
                        self.services.clone(),
                        self.peer_set_builder.build(),
                        self.weak_self.clone(),
                    );
                    registry
                        .skip_lists
                        .insert(finish_hash, Arc::downgrade(&skip_list));
                    (skip_list, true)
                }
            };

            let task = LedgerReplayTask::new(
                &self.config,
                self.services.clone(),
                self.weak_self.clone(),
                parameter,
                skip_list.clone(),
            );
            registry.tasks.push(task.clone());

            tracing::debug!(tasks = registry.tasks.len(), new_skip_list, "created replay task");
            metrics::counter!("ledger_replay.task.created", 1);
            metrics::gauge!("ledger_replay.tasks", registry.tasks.len() as f64);

            (task, skip_list, new_skip_list)
        };

        drop(failed_skip_list);

        if new_skip_list {
            skip_list.init(1);
        }
        task.init();
    }

    /// Creates or reuses the deltas for a task whose range is known.
    pub(crate) fn create_deltas(&self, task: &Arc<LedgerReplayTask>) {
        let parameter = task.parameter();
        if !parameter.is_full() {
            return;
        }

        // Sub-tasks can be dropped here, so they must outlive the registry lock.
        let mut deltas = Vec::with_capacity(parameter.total_ledgers() as usize);
        let mut failed_deltas = Vec::new();
        {
            let mut registry = self.registry();
            if registry.stopping {
                return;
            }

            for (hash, seq) in parameter.delta_ledgers() {
                match registry.deltas.get(&hash).and_then(Weak::upgrade) {
                    Some(delta) if delta.status() != DeltaStatus::Failed => {
                        debug_assert_eq!(delta.seq(), seq, "ledger hashes identify sequences");
                        deltas.push((delta, false));
                    }
                    cached => {
                        failed_deltas.extend(cached);

                        let delta = LedgerDeltaAcquire::new(
                            hash,
                            seq,
                            self.config.clone(),
                            self.services.clone(),
                            self.peer_set_builder.build(),
                            self.weak_self.clone(),
                        );
                        registry.deltas.insert(hash, Arc::downgrade(&delta));
                        deltas.push((delta, true));
                    }
                }
            }
        }

        tracing::debug!(
            hash = ?task.hash(),
            deltas = deltas.len(),
            new = deltas.iter().filter(|(_, new)| *new).count(),
            replaced = failed_deltas.len(),
            "created replay deltas",
        );
        drop(failed_deltas);

        for (delta, new) in deltas {
            task.add_delta(delta.clone());
            delta.add_task(task);
            if new {
                delta.init(1);
            }
        }
    }

    /// Routes a verified skip list item to its acquisition.
    pub fn got_skip_list(&self, header: &LedgerHeader, item: &[u8]) {
        let hash = header.hash();
        let skip_list = self.registry().skip_lists.get(&hash).and_then(Weak::upgrade);

        match skip_list {
            Some(skip_list) => skip_list.process_data(header.seq, item),
            None => tracing::trace!(?hash, "no skip list acquisition for peer data"),
        }
    }

    /// Routes a verified header and transaction set to its acquisition.
    pub fn got_replay_delta(&self, header: LedgerHeader, transactions: OrderedTransactions) {
        let hash = header.hash();
        let delta = self.registry().deltas.get(&hash).and_then(Weak::upgrade);

        match delta {
            Some(delta) => delta.process_data(header, transactions),
            None => tracing::trace!(?hash, "no replay delta acquisition for peer data"),
        }
    }

    /// Removes finished tasks, and forgets sub-tasks that no task uses.
    pub fn sweep(&self) {
        let finished = {
            let mut registry = self.registry();

            let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut registry.tasks)
                .into_iter()
                .partition(|task| task.is_finished());
            registry.tasks = live;

            registry.skip_lists.retain(|_, skip_list| skip_list.strong_count() > 0);
            registry.deltas.retain(|_, delta| delta.strong_count() > 0);

            metrics::gauge!("ledger_replay.tasks", registry.tasks.len() as f64);
            tracing::debug!(
                removed = finished.len(),
                tasks = registry.tasks.len(),
                skip_lists = registry.skip_lists.len(),
                deltas = registry.deltas.len(),
                "swept ledger replayer",
            );

            finished
        };

        // Dropping the finished tasks can drop their sub-tasks, which lock the registry.
        drop(finished);
    }

    /// Spawns a task that calls [`LedgerReplayer::sweep`] every `sweep_interval`.
    ///
    /// The task exits once the replayer is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let replayer = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

            loop {
                timer.tick().await;

                let Some(replayer) = replayer.upgrade() else {
                    break;
                };
                if replayer.is_stopping() {
                    break;
                }

                replayer.sweep();
            }

            tracing::debug!("ledger replay sweeper exited");
        })
    }

    /// Cancels every task and sub-task, and refuses new requests.
    pub fn stop(&self) {
        let mut skip_lists = Vec::new();
        let mut deltas = Vec::new();
        let tasks = {
            let mut registry = self.registry();
            registry.stopping = true;

            skip_lists.extend(registry.skip_lists.drain().filter_map(|(_, s)| s.upgrade()));
            deltas.extend(registry.deltas.drain().filter_map(|(_, d)| d.upgrade()));

            std::mem::take(&mut registry.tasks)
        };

        tracing::info!(
            tasks = tasks.len(),
            skip_lists = skip_lists.len(),
            deltas = deltas.len(),
            "stopping ledger replayer",
        );

        for task in &tasks {
            task.cancel();
        }
        for skip_list in &skip_lists {
            skip_list.cancel();
        }
        for delta in &deltas {
            delta.cancel();
        }

        metrics::gauge!("ledger_replay.tasks", 0.0);
    }

    /// Returns `true` once [`LedgerReplayer::stop`] has been called.
    pub fn is_stopping(&self) -> bool {
        self.registry().stopping
    }

    /// The number of tasks, including finished tasks that haven't been swept.
    pub fn task_count(&self) -> usize {
        self.registry().tasks.len()
    }

    /// The number of skip list acquisitions in the cache.
    pub fn skip_list_count(&self) -> usize {
        self.registry().skip_lists.len()
    }

    /// The number of delta acquisitions in the cache.
    pub fn delta_count(&self) -> usize {
        self.registry().deltas.len()
    }

    /// A snapshot of the current tasks.
    pub fn tasks(&self) -> Vec<Arc<LedgerReplayTask>> {
        self.registry().tasks.clone()
    }

    /// Returns the live skip list acquisition for `hash`.
    pub fn skip_list(&self, hash: Hash) -> Option<Arc<SkipListAcquire>> {
        self.registry().skip_lists.get(&hash).and_then(Weak::upgrade)
    }

    /// Returns the live delta acquisition for `hash`.
    pub fn delta(&self, hash: Hash) -> Option<Arc<LedgerDeltaAcquire>> {
        self.registry().deltas.get(&hash).and_then(Weak::upgrade)
    }

    /// Forgets a dropped skip list acquisition, unless it has been replaced.
    pub(crate) fn remove_skip_list(&self, hash: Hash) {
        let mut registry = self.registry();
        if registry
            .skip_lists
            .get(&hash)
            .map_or(false, |skip_list| skip_list.strong_count() == 0)
        {
            registry.skip_lists.remove(&hash);
        }
    }

    /// Forgets a dropped delta acquisition, unless it has been replaced.
    pub(crate) fn remove_delta(&self, hash: Hash) {
        let mut registry = self.registry();
        if registry
            .deltas
            .get(&hash)
            .map_or(false, |delta| delta.strong_count() == 0)
        {
            registry.deltas.remove(&hash);
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .expect("ledger replayer mutex should be unpoisoned")
    }
}
