use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryAttempt, Notification, NotificationStatus};

use super::{NotificationRepository, TargetRegistry};

#[derive(Debug, Clone)]
struct TargetEntry {
    recipient_id: Uuid,
    channel: Channel,
    address: String,
    active: bool,
}

#[derive(Default)]
struct Inner {
    notifications: HashMap<Uuid, Notification>,
    attempts: Vec<DeliveryAttempt>,
    targets: Vec<TargetEntry>,
}

/// Process-local store implementing both persistence contracts.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    inner: Mutex<Inner>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic in another holder leaves the maps consistent; keep serving.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_target(&self, recipient_id: Uuid, channel: Channel, address: &str) {
        let mut inner = self.lock();
        let existing = inner
            .targets
            .iter()
            .position(|t| t.recipient_id == recipient_id && t.channel == channel && t.address == address);
        match existing {
            Some(idx) => inner.targets[idx].active = true,
            None => inner.targets.push(TargetEntry {
                recipient_id,
                channel,
                address: address.to_string(),
                active: true,
            }),
        }
    }

    pub fn is_target_active(&self, channel: Channel, address: &str) -> bool {
        self.lock()
            .targets
            .iter()
            .any(|t| t.channel == channel && t.address == address && t.active)
    }

    /// Raw lookup, including soft-deleted rows.
    pub fn get(&self, id: Uuid) -> Option<Notification> {
        self.lock().notifications.get(&id).cloned()
    }

    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.lock().attempts.clone()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationStore {
    async fn find(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        Ok(self
            .lock()
            .notifications
            .get(&id)
            .filter(|n| n.deleted_at.is_none())
            .cloned())
    }

    async fn insert(&self, notification: &Notification) -> Result<(), AppError> {
        let mut inner = self.lock();
        if inner.notifications.contains_key(&notification.id) {
            return Err(AppError::Validation(format!(
                "Notification {} already exists",
                notification.id
            )));
        }
        inner
            .notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn save(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> Result<(), AppError> {
        let mut inner = self.lock();
        match inner.notifications.get_mut(&notification.id) {
            Some(existing) if existing.deleted_at.is_none() => {
                if existing.status != expected {
                    return Err(AppError::Conflict(format!(
                        "Notification {} is {}, expected {}",
                        notification.id, existing.status, expected
                    )));
                }
                *existing = notification.clone();
                Ok(())
            }
            _ => Err(AppError::NotFound(format!(
                "Notification {} not found",
                notification.id
            ))),
        }
    }

    async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), AppError> {
        self.lock().attempts.push(attempt.clone());
        Ok(())
    }

    async fn delivery_attempts(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .filter(|a| a.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn find_attempt_by_external_id(
        &self,
        channel: Channel,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        Ok(self
            .lock()
            .attempts
            .iter()
            .rev()
            .find(|a| a.channel == channel && a.external_id.as_deref() == Some(external_id))
            .cloned())
    }
}

#[async_trait]
impl TargetRegistry for InMemoryNotificationStore {
    async fn targets(&self, recipient_id: Uuid, channel: Channel) -> Result<Vec<String>, AppError> {
        Ok(self
            .lock()
            .targets
            .iter()
            .filter(|t| t.recipient_id == recipient_id && t.channel == channel && t.active)
            .map(|t| t.address.clone())
            .collect())
    }

    async fn deactivate(&self, channel: Channel, address: &str) -> Result<(), AppError> {
        for entry in self
            .lock()
            .targets
            .iter_mut()
            .filter(|t| t.channel == channel && t.address == address)
        {
            entry.active = false;
        }
        Ok(())
    }
}
