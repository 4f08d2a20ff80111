//! Delivery record manager: append-only attempt history per notification.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryAttempt, DeliveryStatus};

use crate::channels::ChannelResult;
use crate::store::{NotificationRepository, TargetRegistry};

#[derive(Clone)]
pub struct DeliveryRecorder {
    repo: Arc<dyn NotificationRepository>,
    targets: Arc<dyn TargetRegistry>,
}

impl DeliveryRecorder {
    pub fn new(repo: Arc<dyn NotificationRepository>, targets: Arc<dyn TargetRegistry>) -> Self {
        Self { repo, targets }
    }

    /// Append one attempt for `(notification, channel, target)`.
    ///
    /// An invalid-target failure also deactivates the target. Deactivation
    /// errors are logged and do not fail the recording.
    pub async fn record_attempt(
        &self,
        notification_id: Uuid,
        channel: Channel,
        target: &str,
        result: &ChannelResult,
        at: DateTime<Utc>,
    ) -> Result<DeliveryAttempt, AppError> {
        let attempt = DeliveryAttempt {
            id: Uuid::new_v4(),
            notification_id,
            channel,
            target: target.to_string(),
            status: if result.success {
                DeliveryStatus::Sent
            } else {
                DeliveryStatus::Failed
            },
            external_id: result.external_id.clone(),
            error_detail: result.error.clone(),
            attempted_at: at,
        };

        self.repo.append_delivery_attempt(&attempt).await?;

        if result.target_invalid && channel.requires_registered_target() {
            if let Err(e) = self.targets.deactivate(channel, target).await {
                tracing::warn!(
                    notification_id = %notification_id,
                    channel = %channel,
                    error = %e,
                    "Failed to deactivate invalid target"
                );
            }
        }

        Ok(attempt)
    }

    /// Per-channel status: `sent` if any attempt on the channel succeeded,
    /// otherwise the status of the latest attempt.
    pub async fn channel_statuses(
        &self,
        notification_id: Uuid,
    ) -> Result<BTreeMap<Channel, DeliveryStatus>, AppError> {
        let attempts = self.repo.delivery_attempts(notification_id).await?;
        Ok(fold_channel_statuses(&attempts))
    }

    pub async fn has_any_success(&self, notification_id: Uuid) -> Result<bool, AppError> {
        let attempts = self.repo.delivery_attempts(notification_id).await?;
        Ok(attempts.iter().any(|a| a.status == DeliveryStatus::Sent))
    }

    /// Look up the attempt a vendor receipt refers to.
    pub async fn find_by_external_id(
        &self,
        channel: Channel,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        self.repo
            .find_attempt_by_external_id(channel, external_id)
            .await
    }
}

fn fold_channel_statuses(attempts: &[DeliveryAttempt]) -> BTreeMap<Channel, DeliveryStatus> {
    let mut ordered: Vec<&DeliveryAttempt> = attempts.iter().collect();
    ordered.sort_by_key(|a| a.attempted_at);

    let mut statuses = BTreeMap::new();
    for attempt in ordered {
        let entry = statuses.entry(attempt.channel).or_insert(attempt.status);
        if *entry != DeliveryStatus::Sent {
            *entry = attempt.status;
        }
    }
    statuses
}
