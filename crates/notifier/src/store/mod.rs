//! Persistence contracts used by the dispatch path.
//!
//! [`NotificationRepository`] owns notifications and their attempt history,
//! [`TargetRegistry`] resolves channel targets for a recipient. Both are
//! implemented by [`PgNotificationStore`] for production and by
//! [`InMemoryNotificationStore`] for tests and embedding.

mod memory;
mod postgres;

pub use memory::InMemoryNotificationStore;
pub use postgres::PgNotificationStore;

use async_trait::async_trait;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryAttempt, Notification, NotificationStatus};

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// Load a notification. Soft-deleted rows are not returned.
    async fn find(&self, id: Uuid) -> Result<Option<Notification>, AppError>;

    async fn insert(&self, notification: &Notification) -> Result<(), AppError>;

    /// Persist the mutable lifecycle fields of an existing notification,
    /// provided its stored status is still `expected`. Fails with
    /// [`AppError::Conflict`] when another writer moved it first.
    async fn save(
        &self,
        notification: &Notification,
        expected: NotificationStatus,
    ) -> Result<(), AppError>;

    /// Append one attempt. Attempts are never updated or deleted.
    async fn append_delivery_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), AppError>;

    /// Attempt history of one notification, oldest first.
    async fn delivery_attempts(&self, notification_id: Uuid)
    -> Result<Vec<DeliveryAttempt>, AppError>;

    async fn find_attempt_by_external_id(
        &self,
        channel: Channel,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError>;
}

#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// Active addresses of a recipient on a channel.
    async fn targets(&self, recipient_id: Uuid, channel: Channel) -> Result<Vec<String>, AppError>;

    /// Deactivate an address on a channel for every recipient holding it.
    /// Idempotent.
    async fn deactivate(&self, channel: Channel, address: &str) -> Result<(), AppError>;
}
