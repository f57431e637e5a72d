//! Cancellable, reschedulable delayed work on the tokio runtime.
//!
//! A scheduled item is one task looping `sleep(delay) -> job()`; the job
//! decides the next delay. Jobs do bus I/O, so each run goes to the blocking
//! pool and the task only waits for it. Cancellation lands between two runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// What a job wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    After(Duration),
    Done,
}

type Job = Arc<dyn Fn() -> Next + Send + Sync>;

struct Scheduled {
    handle: JoinHandle<()>,
    /// Dropped to cancel.
    cancel: oneshot::Sender<()>,
}

pub struct DelayedWork {
    name: String,
    runtime: Handle,
    job: Job,
    task: Mutex<Option<Scheduled>>,
}

impl DelayedWork {
    pub fn new<F>(name: impl Into<String>, runtime: Handle, job: F) -> Self
    where
        F: Fn() -> Next + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            runtime,
            job: Arc::new(job),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<Scheduled>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pending or running.
    pub fn is_pending(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Queues the job after `delay`. Returns false if it was already pending.
    pub fn schedule(&self, delay: Duration) -> bool {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let job = self.job.clone();
        let name = self.name.clone();
        let (cancel, mut cancelled) = oneshot::channel::<()>();
        let handle = self.runtime.spawn(async move {
            let mut delay = delay;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancelled => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let job = job.clone();
                match tokio::task::spawn_blocking(move || job()).await {
                    Ok(Next::After(d)) => delay = d,
                    Ok(Next::Done) => break,
                    Err(e) => {
                        log::error!("{}: job failed: {}", name, e);
                        break;
                    }
                }
            }
            log::debug!("{}: finished", name);
        });
        *task = Some(Scheduled { handle, cancel });
        true
    }

    /// Cancels the pending run and waits until a run in flight has finished.
    /// Returns true if something was pending.
    ///
    /// Must not be awaited from inside the job's own task.
    pub async fn cancel_sync(&self) -> bool {
        let Some(Scheduled { handle, cancel }) = self.task().take() else {
            return false;
        };
        let pending = !handle.is_finished();
        drop(cancel);
        if let Err(e) = handle.await {
            log::error!("{}: task ended abnormally: {}", self.name, e);
        }
        pending
    }

    /// Cancel-and-wait, then queue again after `delay`.
    pub async fn reschedule(&self, delay: Duration) {
        self.cancel_sync().await;
        self.schedule(delay);
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        if let Some(scheduled) = self.task().take() {
            scheduled.handle.abort();
        }
    }
}
