//! User-configurable ledger replay parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;

/// Ledger replay configuration section.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Replay missing ledgers from peer-supplied deltas.
    ///
    /// When disabled, replay requests are dropped and peer replay requests
    /// are answered with an error.
    pub enable: bool,

    /// How long a replay task waits between ticks.
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Task timeouts allowed per ledger in the task's range.
    pub task_max_timeouts_multiplier: u32,

    /// The minimum number of timeouts any task tolerates.
    pub task_max_timeouts_minimum: u32,

    /// How long a skip list or delta acquisition waits between peer retries.
    #[serde(with = "humantime_serde")]
    pub sub_task_timeout: Duration,

    /// Timeouts without progress before a skip list or delta acquisition fails.
    pub sub_task_max_timeouts: u32,

    /// The retry interval once an acquisition has fallen back to
    /// whole-ledger acquisition.
    #[serde(with = "humantime_serde")]
    pub sub_task_fallback_timeout: Duration,

    /// Peers without replay support contacted before falling back.
    pub max_no_feature_peer_count: u32,

    /// The maximum number of concurrent replay tasks.
    pub max_tasks: usize,

    /// The maximum number of ledgers one replay request can cover.
    pub max_task_size: u32,

    /// The job queue length above which timer callbacks are deferred.
    pub max_queued_tasks: usize,

    /// How often [`LedgerReplayer::spawn_sweeper`](crate::LedgerReplayer::spawn_sweeper)
    /// removes finished tasks.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Config {
    /// Returns the number of timeouts allowed for a task covering `total_ledgers`.
    pub fn task_max_timeouts(&self, total_ledgers: u32) -> u32 {
        self.task_max_timeouts_minimum
            .max(total_ledgers.saturating_mul(self.task_max_timeouts_multiplier))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable: false,
            task_timeout: TASK_TIMEOUT,
            task_max_timeouts_multiplier: TASK_MAX_TIMEOUTS_MULTIPLIER,
            task_max_timeouts_minimum: TASK_MAX_TIMEOUTS_MINIMUM,
            sub_task_timeout: SUB_TASK_TIMEOUT,
            sub_task_max_timeouts: SUB_TASK_MAX_TIMEOUTS,
            sub_task_fallback_timeout: SUB_TASK_FALLBACK_TIMEOUT,
            max_no_feature_peer_count: MAX_NO_FEATURE_PEER_COUNT,
            max_tasks: MAX_TASKS,
            max_task_size: MAX_TASK_SIZE,
            max_queued_tasks: MAX_QUEUED_TASKS,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}
