//! Delivery and read receipts.
//!
//! Vendors report delivery against the external id returned at send time;
//! clients report reads against the notification id. Both move the
//! notification forward on the SENT -> DELIVERED -> READ path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::lifecycle::TransitionError;
use courier_common::types::{Channel, NotificationStatus};

use crate::delivery::DeliveryRecorder;
use crate::error::DispatchError;
use crate::store::NotificationRepository;

/// Reload-and-apply rounds when a receipt races another writer.
const MAX_APPLY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    Applied {
        notification_id: Uuid,
        status: NotificationStatus,
    },
    /// Already at or past the receipt's state.
    AlreadyApplied {
        notification_id: Uuid,
        status: NotificationStatus,
    },
    Unknown,
}

#[derive(Clone)]
pub struct DeliveryReceipts {
    repo: Arc<dyn NotificationRepository>,
    recorder: DeliveryRecorder,
}

impl DeliveryReceipts {
    pub fn new(repo: Arc<dyn NotificationRepository>, recorder: DeliveryRecorder) -> Self {
        Self { repo, recorder }
    }

    /// Vendor confirmed delivery of the message sent as `external_id`.
    pub async fn confirm_delivered(
        &self,
        channel: Channel,
        external_id: &str,
        at: DateTime<Utc>,
    ) -> Result<ReceiptOutcome, DispatchError> {
        let Some(attempt) = self.recorder.find_by_external_id(channel, external_id).await? else {
            tracing::debug!(channel = %channel, external_id, "Receipt for unknown message");
            return Ok(ReceiptOutcome::Unknown);
        };
        let id = attempt.notification_id;

        for _ in 0..MAX_APPLY_ATTEMPTS {
            let Some(mut notification) = self.repo.find(id).await? else {
                return Ok(ReceiptOutcome::Unknown);
            };

            match notification.status {
                NotificationStatus::Sent => {
                    notification.mark_delivered(at)?;
                    match self.repo.save(&notification, NotificationStatus::Sent).await {
                        Ok(()) => {
                            tracing::info!(notification_id = %id, channel = %channel, "Delivery confirmed");
                            return Ok(ReceiptOutcome::Applied {
                                notification_id: id,
                                status: notification.status,
                            });
                        }
                        Err(AppError::Conflict(reason)) => {
                            tracing::debug!(notification_id = %id, reason = %reason, "Receipt raced another update, reloading");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                NotificationStatus::Delivered | NotificationStatus::Read => {
                    return Ok(ReceiptOutcome::AlreadyApplied {
                        notification_id: id,
                        status: notification.status,
                    });
                }
                from => {
                    return Err(DispatchError::Transition(TransitionError::Illegal {
                        from,
                        to: NotificationStatus::Delivered,
                    }));
                }
            }
        }

        Err(contended(id))
    }

    /// Recipient opened the notification.
    pub async fn confirm_read(
        &self,
        notification_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ReceiptOutcome, DispatchError> {
        for _ in 0..MAX_APPLY_ATTEMPTS {
            let Some(mut notification) = self.repo.find(notification_id).await? else {
                return Ok(ReceiptOutcome::Unknown);
            };

            if notification.status == NotificationStatus::Read {
                return Ok(ReceiptOutcome::AlreadyApplied {
                    notification_id,
                    status: notification.status,
                });
            }

            let loaded = notification.status;
            notification.mark_read(at)?;
            match self.repo.save(&notification, loaded).await {
                Ok(()) => {
                    tracing::info!(notification_id = %notification_id, "Notification read");
                    return Ok(ReceiptOutcome::Applied {
                        notification_id,
                        status: notification.status,
                    });
                }
                Err(AppError::Conflict(reason)) => {
                    tracing::debug!(notification_id = %notification_id, reason = %reason, "Receipt raced another update, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(contended(notification_id))
    }
}

fn contended(id: Uuid) -> DispatchError {
    DispatchError::Storage(AppError::Conflict(format!(
        "Notification {} kept changing while applying receipt",
        id
    )))
}
