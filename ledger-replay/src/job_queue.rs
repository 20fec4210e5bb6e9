//! A [`JobQueue`] backed by the tokio runtime.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::runtime::Handle;

use crate::service_traits::{Job, JobQueue};

/// Runs jobs on tokio's blocking thread pool, and timers as tokio sleeps.
///
/// Replay jobs hold `std::sync` locks and call into the transaction engine,
/// so they must not run on the async executor threads.
#[derive(Clone, Debug)]
pub struct TokioJobQueue {
    handle: Handle,
    jobs: Arc<AtomicUsize>,
}

impl TokioJobQueue {
    /// Creates a job queue that spawns onto `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            jobs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Creates a job queue that spawns onto the current runtime.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

/// Decrements the live job count, even if the job panics.
struct JobGuard(Arc<AtomicUsize>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobQueue for TokioJobQueue {
    fn add_job(&self, name: &'static str, job: Job) -> bool {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        let guard = JobGuard(self.jobs.clone());

        let span = tracing::trace_span!("replay_job", job = name);
        self.handle.spawn_blocking(move || {
            let _guard = guard;
            span.in_scope(job);
        });

        true
    }

    fn job_count(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    fn schedule(&self, delay: Duration, on_expire: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            on_expire();
        });
    }
}
