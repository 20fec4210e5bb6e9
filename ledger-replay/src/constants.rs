//! Default limits and timeouts for ledger replay.
//!
//! Each of these is the default for the matching [`Config`](crate::Config) field.

use std::time::Duration;

/// How long a replay task waits between ticks.
///
/// A tick without progress counts as a timeout.
pub const TASK_TIMEOUT: Duration = Duration::from_millis(500);

/// The number of task timeouts allowed per ledger in the task's range.
///
/// ## Correctness
///
/// Long ranges need proportionally more time, because deltas are built one at
/// a time. If this multiplier is too low, large tasks fail while still making
/// progress on slow networks.
pub const TASK_MAX_TIMEOUTS_MULTIPLIER: u32 = 2;

/// The minimum number of timeouts a task tolerates, regardless of its size.
pub const TASK_MAX_TIMEOUTS_MINIMUM: u32 = 10;

/// How long a skip list or delta acquisition waits between peer retries.
pub const SUB_TASK_TIMEOUT: Duration = Duration::from_millis(250);

/// The number of timeouts without progress before a sub-task fails.
pub const SUB_TASK_MAX_TIMEOUTS: u32 = 10;

/// The retry interval after a sub-task has fallen back to whole-ledger acquisition.
///
/// Whole-ledger acquisition is much slower than a replay request, so the
/// sub-task checks less often.
pub const SUB_TASK_FALLBACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// The number of peers without replay support a sub-task contacts before it
/// falls back to whole-ledger acquisition.
pub const MAX_NO_FEATURE_PEER_COUNT: u32 = 2;

/// The maximum number of concurrent replay tasks.
///
/// Further requests are dropped, unless they can be merged into a live task.
pub const MAX_TASKS: usize = 10;

/// The maximum number of ledgers in one replay task.
///
/// A skip list holds at most this many ancestors, so a single skip list
/// acquisition covers the whole range.
pub const MAX_TASK_SIZE: u32 = crate::ledger::MAX_SKIP_LIST_LEN as u32;

/// The job queue length above which timer callbacks are deferred to the next tick.
///
/// ## Correctness
///
/// If the queue is saturated, queueing more retries only delays the jobs that
/// could make progress.
pub const MAX_QUEUED_TASKS: usize = 100;

/// How often finished tasks are removed from the replayer.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
