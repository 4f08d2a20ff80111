//! Batch processor: dispatch over a list of notification ids.
//!
//! Every item is isolated; a failing item is counted and the batch moves on.
//! When the hosting runtime gives up on a batch (crash or timeout) it calls
//! [`BatchProcessor::fail_remaining`] to settle whatever is still pending.

use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::NotificationStatus;

use crate::dispatch::{DeliveryOutcome, DispatchService, Disposition, SkipReason};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Notifications left pending for retry, with the delay before the next attempt.
    pub retries: Vec<(Uuid, Duration)>,
    /// Skipped notifications scheduled for later, with the delay until they are due.
    pub deferred: Vec<(Uuid, Duration)>,
}

/// How a guarded batch run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchRun {
    Completed(BatchReport),
    /// Deadline hit; `marked` pending notifications were failed by cleanup.
    TimedOut { marked: usize },
    /// The batch task panicked; `marked` pending notifications were failed by cleanup.
    Crashed { marked: usize },
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Pause after this many dispatched items. Zero disables throttling.
    pub throttle_every: usize,
    pub throttle_pause: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            throttle_every: 10,
            throttle_pause: Duration::from_millis(100),
        }
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            throttle_every: config.batch_throttle_every,
            throttle_pause: Duration::from_millis(config.batch_throttle_pause_ms),
        }
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    dispatcher: DispatchService,
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(dispatcher: DispatchService, config: BatchConfig) -> Self {
        Self { dispatcher, config }
    }

    pub async fn process_batch(&self, ids: &[Uuid]) -> BatchReport {
        let mut report = BatchReport::default();
        let mut dispatched = 0usize;

        tracing::info!(batch_size = ids.len(), "Processing notification batch");

        for (idx, id) in ids.iter().enumerate() {
            report.processed += 1;

            match self.dispatcher.dispatch(*id).await {
                Ok(DeliveryOutcome::Skipped { reason, .. }) => {
                    report.skipped += 1;
                    if let SkipReason::NotDue { scheduled_at } = reason {
                        let delay = (scheduled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        report.deferred.push((*id, delay));
                    }
                    tracing::debug!(notification_id = %id, reason = %reason, "Batch item skipped");
                    continue;
                }
                Ok(DeliveryOutcome::Dispatched(result)) => {
                    if result.success {
                        report.succeeded += 1;
                    } else {
                        report.failed += 1;
                        if let Disposition::Retry { backoff, .. } = result.disposition {
                            report.retries.push((*id, backoff));
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(notification_id = %id, error = %e, "Batch item failed");
                }
            }

            dispatched += 1;
            let more_left = idx + 1 < ids.len();
            if self.config.throttle_every > 0
                && dispatched % self.config.throttle_every == 0
                && more_left
            {
                tokio::time::sleep(self.config.throttle_pause).await;
            }
        }

        tracing::info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            retries = report.retries.len(),
            deferred = report.deferred.len(),
            "Notification batch completed"
        );

        report
    }

    /// Run the batch on its own task under `deadline`. On timeout or panic
    /// the task is dropped and every still-pending id goes through
    /// [`Self::fail_remaining`].
    pub async fn process_batch_with_deadline(&self, ids: Vec<Uuid>, deadline: Duration) -> BatchRun {
        let processor = self.clone();
        let task_ids = ids.clone();
        let handle = tokio::spawn(async move { processor.process_batch(&task_ids).await });
        let abort = handle.abort_handle();

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(report)) => BatchRun::Completed(report),
            Ok(Err(e)) => {
                tracing::error!(error = %e, batch_size = ids.len(), "Batch task crashed");
                let marked = self.fail_remaining(&ids, "batch worker crashed").await;
                BatchRun::Crashed { marked }
            }
            Err(_) => {
                abort.abort();
                tracing::warn!(
                    deadline_secs = deadline.as_secs(),
                    batch_size = ids.len(),
                    "Batch timed out"
                );
                let marked = self.fail_remaining(&ids, "batch timed out").await;
                BatchRun::TimedOut { marked }
            }
        }
    }

    /// Mark every still-pending notification in `ids` as failed with `note`.
    /// Best effort per id; returns how many were marked.
    pub async fn fail_remaining(&self, ids: &[Uuid], note: &str) -> usize {
        let repo = self.dispatcher.repository();
        let mut marked = 0;

        for id in ids {
            let mut notification = match repo.find(*id).await {
                Ok(Some(n)) if n.is_pending() => n,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Cleanup lookup failed");
                    continue;
                }
            };

            if let Err(e) = notification.mark_failed(note, Utc::now()) {
                tracing::error!(notification_id = %id, error = %e, "Cleanup transition rejected");
                continue;
            }
            match repo.save(&notification, NotificationStatus::Pending).await {
                Ok(()) => marked += 1,
                // Settled by its in-flight dispatch; keep that result.
                Err(AppError::Conflict(reason)) => {
                    tracing::debug!(notification_id = %id, reason = %reason, "Cleanup skipped, already settled")
                }
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Cleanup save failed")
                }
            }
        }

        tracing::warn!(marked, batch_size = ids.len(), note, "Batch cleanup finished");
        marked
    }
}
