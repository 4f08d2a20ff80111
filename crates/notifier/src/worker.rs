//! Queue worker: pops jobs, runs them on bounded tasks, reschedules retries
//! and notifications that are not due yet.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::batch::{BatchProcessor, BatchRun};
use crate::dispatch::DispatchService;
use crate::policy::compute_backoff;
use crate::queue::{Job, JobQueue};

/// `BRPOP` wait per loop. Also the cadence of retry promotion when idle.
const POP_TIMEOUT_SECS: f64 = 1.0;

/// Pause after a queue error before polling again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct NotificationWorker {
    queue: JobQueue,
    dispatcher: DispatchService,
    batch: BatchProcessor,
    limiter: Arc<Semaphore>,
    batch_timeout: Duration,
}

impl NotificationWorker {
    pub fn new(
        queue: JobQueue,
        dispatcher: DispatchService,
        batch: BatchProcessor,
        concurrency: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            batch,
            limiter: Arc::new(Semaphore::new(concurrency.max(1))),
            batch_timeout,
        }
    }

    /// Main loop. Runs until the task is dropped.
    pub async fn run(&self) -> anyhow::Result<()> {
        tracing::info!(
            concurrency = self.limiter.available_permits(),
            batch_timeout_secs = self.batch_timeout.as_secs(),
            "Notification worker started"
        );

        loop {
            if let Err(e) = self.queue.promote_due(Utc::now()).await {
                tracing::warn!(error = %e, "Failed to promote due retries");
            }

            let permit = self.limiter.clone().acquire_owned().await?;

            let job = match self.queue.pop(POP_TIMEOUT_SECS).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pop job");
                    tokio::time::sleep(ERROR_PAUSE).await;
                    continue;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle(job).await;
                drop(permit);
            });
        }
    }

    pub async fn handle(&self, job: Job) {
        match job {
            Job::Dispatch { id } => self.handle_dispatch(id).await,
            Job::Batch { ids } => self.handle_batch(ids).await,
        }
    }

    async fn handle_dispatch(&self, id: Uuid) {
        match self.dispatcher.dispatch(id).await {
            Ok(outcome) => {
                if let Some(delay) = outcome.requeue_delay(Utc::now()) {
                    self.reschedule(id, delay).await;
                }
            }
            // Storage hiccup: try again later without spending retry budget.
            Err(e) if e.is_transient() => {
                tracing::warn!(notification_id = %id, error = %e, "Dispatch interrupted");
                self.reschedule(id, compute_backoff(0)).await;
            }
            Err(e) => {
                tracing::error!(notification_id = %id, error = %e, "Dispatch failed");
            }
        }
    }

    async fn handle_batch(&self, ids: Vec<Uuid>) {
        match self
            .batch
            .process_batch_with_deadline(ids, self.batch_timeout)
            .await
        {
            BatchRun::Completed(report) => {
                for (id, delay) in report.retries.into_iter().chain(report.deferred) {
                    self.reschedule(id, delay).await;
                }
            }
            BatchRun::TimedOut { marked } | BatchRun::Crashed { marked } => {
                tracing::warn!(marked, "Batch aborted, remaining notifications failed");
            }
        }
    }

    async fn reschedule(&self, id: Uuid, delay: Duration) {
        if let Err(e) = self.queue.schedule_retry(id, delay).await {
            // Stays PENDING in storage; an external sweep can still pick it up.
            tracing::error!(notification_id = %id, error = %e, "Failed to schedule retry");
        }
    }
}
