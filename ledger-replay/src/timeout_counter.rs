//! The retry timer shared by replay tasks and their sub-tasks.
//!
//! Every acquisition retries on a fixed interval until it completes, fails,
//! or runs out of timeouts. A tick where the object made progress doesn't
//! count as a timeout.
//!
//! Timer expiry never runs the retry inline: it queues a job, so retries
//! share the node's job queue limits.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{ledger::Hash, service_traits::JobQueue, task::Notification};

/// The status of an acquisition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireStatus {
    /// Still acquiring.
    Pending,
    /// Acquired.
    Complete,
    /// Failed or cancelled.
    Failed,
}

/// Retry bookkeeping, kept inside each acquisition's locked state.
#[derive(Clone, Debug)]
pub(crate) struct TimeoutCounter {
    hash: Hash,
    interval: Duration,
    job_limit: usize,
    timeouts: u32,
    max_timeouts: u32,
    status: AcquireStatus,
    progress: bool,
}

impl TimeoutCounter {
    pub fn new(hash: Hash, interval: Duration, max_timeouts: u32, job_limit: usize) -> Self {
        Self {
            hash,
            interval,
            job_limit,
            timeouts: 0,
            max_timeouts,
            status: AcquireStatus::Pending,
            progress: false,
        }
    }

    pub fn status(&self) -> AcquireStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status != AcquireStatus::Pending
    }

    pub fn is_complete(&self) -> bool {
        self.status == AcquireStatus::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.status == AcquireStatus::Failed
    }

    pub fn mark_complete(&mut self) {
        self.status = AcquireStatus::Complete;
    }

    pub fn mark_failed(&mut self) {
        self.status = AcquireStatus::Failed;
    }

    /// Marks the object as failed, unless it is already done.
    pub fn cancel(&mut self) {
        if !self.is_done() {
            tracing::debug!(hash = ?self.hash, "cancelled replay acquisition");
            self.mark_failed();
        }
    }

    /// Stops the next tick from counting as a timeout.
    pub fn make_progress(&mut self) {
        self.progress = true;
    }

    /// Returns `true` if the object has timed out more than its limit.
    pub fn is_exhausted(&self) -> bool {
        self.timeouts > self.max_timeouts
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Updates the counters for a tick, returning `true` if there was progress.
    fn tick(&mut self) -> bool {
        let progress = std::mem::take(&mut self.progress);
        if !progress {
            self.timeouts += 1;
        }
        progress
    }
}

/// An object driven by a [`TimeoutCounter`].
pub(crate) trait Retryable: Send + Sync + Sized + 'static {
    /// The locked state, which contains the counter.
    type State: Send;

    /// The job name used for timer jobs.
    const JOB_NAME: &'static str;

    fn state(&self) -> &Mutex<Self::State>;

    fn counter(state: &mut Self::State) -> &mut TimeoutCounter;

    fn jobs(&self) -> &Arc<dyn JobQueue>;

    /// Called on each tick while the object isn't done.
    ///
    /// The returned notification is delivered after the lock is released.
    fn on_timer(
        self: &Arc<Self>,
        state: &mut Self::State,
        progress: bool,
    ) -> Option<Notification>;

    fn lock(&self) -> MutexGuard<'_, Self::State> {
        self.state()
            .lock()
            .expect("replay acquisition mutex should be unpoisoned")
    }
}

/// Arms the retry timer, unless the object is done.
///
/// The timer only holds a weak reference, so it never keeps a dropped object alive.
pub(crate) fn set_timer<T: Retryable>(this: &Arc<T>, counter: &TimeoutCounter) {
    if counter.is_done() {
        return;
    }

    let weak = Arc::downgrade(this);
    this.jobs().schedule(
        counter.interval,
        Box::new(move || {
            if let Some(this) = weak.upgrade() {
                queue_job(&this);
            }
        }),
    );
}

/// Handles timer expiry by queueing a retry job.
///
/// If the job queue is already at its limit, waits for another interval instead.
fn queue_job<T: Retryable>(this: &Arc<T>) {
    {
        let mut state = this.lock();
        let counter = T::counter(&mut *state);
        if counter.is_done() {
            return;
        }

        let queued = this.jobs().job_count();
        if queued >= counter.job_limit {
            tracing::trace!(
                hash = ?counter.hash,
                queued,
                limit = counter.job_limit,
                "job queue is full, deferring replay timer",
            );
            set_timer(this, counter);
            return;
        }
    }

    let weak = Arc::downgrade(this);
    let queued = this.jobs().add_job(
        T::JOB_NAME,
        Box::new(move || {
            if let Some(this) = weak.upgrade() {
                invoke_on_timer(&this);
            }
        }),
    );

    if !queued {
        tracing::debug!(job = T::JOB_NAME, "job queue is shutting down, dropped replay timer");
    }
}

/// Runs one tick: counts the timeout, calls the object's handler, and re-arms the timer.
pub(crate) fn invoke_on_timer<T: Retryable>(this: &Arc<T>) {
    let notification = {
        let mut state = this.lock();

        let counter = T::counter(&mut *state);
        if counter.is_done() {
            return;
        }

        let progress = counter.tick();
        if !progress {
            tracing::trace!(
                hash = ?counter.hash,
                timeouts = counter.timeouts,
                job = T::JOB_NAME,
                "replay timeout",
            );
        }

        let notification = this.on_timer(&mut *state, progress);

        set_timer(this, T::counter(&mut *state));

        notification
    };

    if let Some(notification) = notification {
        notification.deliver();
    }
}
