//! Bounded, rate-paced task executor.
//!
//! A [`WorkerScheduler`] runs at most `workers` tasks at once and, when a
//! pacing interval is set, starts at most one task per interval. The first
//! start waits one full interval; ticks missed while the scheduler is idle
//! are not replayed as a burst.
//!
//! Task errors and panics are captured, never propagated to the caller of
//! [`submit`](WorkerScheduler::submit). [`wait`](WorkerScheduler::wait)
//! drains all work and returns what was captured.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};

#[derive(Default)]
struct Pacer {
    period: Option<Duration>,
    interval: Option<Interval>,
}

impl Pacer {
    async fn tick(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
    }
}

struct Inner {
    workers: usize,
    semaphore: Arc<Semaphore>,
    pacer: tokio::sync::Mutex<Pacer>,
    errors: Mutex<Vec<PipelineError>>,
    pending: AtomicUsize,
    idle: Notify,
    released: AtomicBool,
    cancel: CancelToken,
}

impl Inner {
    fn record(&self, err: PipelineError) {
        debug!(error = %err, "scheduled task failed");
        self.errors.lock().unwrap().push(err);
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| PipelineError::Cancelled)
            }
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    async fn run<F>(self: Arc<Self>, permit: OwnedSemaphorePermit, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let _permit = permit;
        let inner = self.clone();
        let paced = async move {
            inner.pacer.lock().await.tick().await;
            task.await
        };
        let result = tokio::select! {
            outcome = AssertUnwindSafe(paced).catch_unwind() => match outcome {
                Ok(result) => result,
                Err(panic) => Err(PipelineError::Panicked(panic_message(panic))),
            },
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
        };
        if let Err(err) = result {
            self.record(err);
        }
        self.finish_one();
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bounded worker pool with optional start pacing. Cheap to clone; clones
/// share the same pool.
#[derive(Clone)]
pub struct WorkerScheduler {
    inner: Arc<Inner>,
}

impl WorkerScheduler {
    /// `workers` is clamped to at least one. `pace` is the minimum interval
    /// between task starts; `None` or zero disables pacing.
    pub fn new(workers: usize, pace: Option<Duration>, cancel: CancelToken) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(Inner {
                workers,
                semaphore: Arc::new(Semaphore::new(workers)),
                pacer: tokio::sync::Mutex::new(Pacer {
                    period: pace.filter(|p| !p.is_zero()),
                    interval: None,
                }),
                errors: Mutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                released: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Enqueue a task, waiting while all workers are busy.
    ///
    /// Fails with [`PipelineError::Cancelled`] once the scheduler is released
    /// or its run is cancelled; the refusal is also recorded.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        match self.inner.acquire().await {
            Ok(permit) => {
                tokio::spawn(self.inner.clone().run(permit, task));
                Ok(())
            }
            Err(err) => {
                self.inner.record(PipelineError::Cancelled);
                self.inner.finish_one();
                Err(err)
            }
        }
    }

    /// Enqueue a follow-up task without waiting for a free worker.
    ///
    /// Meant for tasks that schedule more work (the next page of a listing):
    /// a task holding a worker must not block on the pool it occupies.
    pub fn next_tick<F>(&self, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.acquire().await {
                Ok(permit) => inner.run(permit, task).await,
                Err(err) => {
                    inner.record(err);
                    inner.finish_one();
                }
            }
        });
    }

    /// Wait until every submitted task has finished, then return the
    /// captured errors (one error as itself, several as an aggregate).
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        let errors = std::mem::take(&mut *self.inner.errors.lock().unwrap());
        PipelineError::from_list(errors)
    }

    /// True once any task has failed. Producers use it to stop feeding work.
    pub fn has_error(&self) -> bool {
        !self.inner.errors.lock().unwrap().is_empty()
    }

    /// Change the pacing interval. Takes effect for the next start.
    pub async fn reset(&self, pace: Option<Duration>) {
        let mut pacer = self.inner.pacer.lock().await;
        pacer.period = pace.filter(|p| !p.is_zero());
        pacer.interval = None;
    }

    /// Refuse further work. In-flight tasks run to completion; tasks still
    /// waiting for a worker are recorded as cancelled. Idempotent.
    pub fn release(&self) {
        if !self.inner.released.swap(true, Ordering::SeqCst) {
            self.inner.semaphore.close();
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}
