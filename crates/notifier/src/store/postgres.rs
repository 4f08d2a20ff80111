use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, DeliveryAttempt, Notification, NotificationStatus};

use super::{NotificationRepository, TargetRegistry};

/// PostgreSQL-backed notification repository and target registry.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a target for a recipient, reactivating it if it was disabled.
    pub async fn add_target(
        &self,
        recipient_id: Uuid,
        channel: Channel,
        address: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notification_targets (recipient_id, channel, address, active)
            VALUES ($1, $2, $3, true)
            ON CONFLICT (recipient_id, channel, address)
            DO UPDATE SET active = true, deactivated_at = NULL
            "#,
        )
        .bind(recipient_id)
        .bind(channel)
        .bind(address)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for PgNotificationStore {
    async fn find(&self, id: Uuid) -> Result<Option<Notification>, AppError> {
        let notification: Option<Notification> =
            sqlx::query_as("SELECT * FROM notifications WHERE id = $1 AND deleted_at IS NULL")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(notification)
    }

    async fn insert(&self, n: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, recipient_id, type, status, title, message, data, channels, priority,
                scheduled_at, sent_at, delivered_at, read_at, expires_at,
                retry_count, max_retries, group_key, external_id, metadata,
                created_at, updated_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(n.id)
        .bind(n.recipient_id)
        .bind(n.notification_type)
        .bind(n.status)
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.data)
        .bind(Json(&n.channels))
        .bind(n.priority)
        .bind(n.scheduled_at)
        .bind(n.sent_at)
        .bind(n.delivered_at)
        .bind(n.read_at)
        .bind(n.expires_at)
        .bind(n.retry_count)
        .bind(n.max_retries)
        .bind(&n.group_key)
        .bind(&n.external_id)
        .bind(&n.metadata)
        .bind(n.created_at)
        .bind(n.updated_at)
        .bind(n.deleted_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(notification_id = %n.id, "Notification inserted");
        Ok(())
    }

    async fn save(&self, n: &Notification, expected: NotificationStatus) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, sent_at = $2, delivered_at = $3, read_at = $4,
                retry_count = $5, metadata = $6, updated_at = $7
            WHERE id = $8 AND deleted_at IS NULL AND status = $9
            "#,
        )
        .bind(n.status)
        .bind(n.sent_at)
        .bind(n.delivered_at)
        .bind(n.read_at)
        .bind(n.retry_count)
        .bind(&n.metadata)
        .bind(n.updated_at)
        .bind(n.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<(NotificationStatus,)> =
            sqlx::query_as("SELECT status FROM notifications WHERE id = $1 AND deleted_at IS NULL")
                .bind(n.id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            Some((status,)) => Err(AppError::Conflict(format!(
                "Notification {} is {}, expected {}",
                n.id, status, expected
            ))),
            None => Err(AppError::NotFound(format!("Notification {} not found", n.id))),
        }
    }

    async fn append_delivery_attempt(&self, a: &DeliveryAttempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_attempts
                (id, notification_id, channel, target, status, external_id, error_detail, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(a.id)
        .bind(a.notification_id)
        .bind(a.channel)
        .bind(&a.target)
        .bind(a.status)
        .bind(&a.external_id)
        .bind(&a.error_detail)
        .bind(a.attempted_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delivery_attempts(
        &self,
        notification_id: Uuid,
    ) -> Result<Vec<DeliveryAttempt>, AppError> {
        let attempts: Vec<DeliveryAttempt> = sqlx::query_as(
            "SELECT * FROM delivery_attempts WHERE notification_id = $1 ORDER BY attempted_at, id",
        )
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(attempts)
    }

    async fn find_attempt_by_external_id(
        &self,
        channel: Channel,
        external_id: &str,
    ) -> Result<Option<DeliveryAttempt>, AppError> {
        let attempt: Option<DeliveryAttempt> = sqlx::query_as(
            r#"
            SELECT * FROM delivery_attempts
            WHERE channel = $1 AND external_id = $2
            ORDER BY attempted_at DESC
            LIMIT 1
            "#,
        )
        .bind(channel)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(attempt)
    }
}

#[async_trait]
impl TargetRegistry for PgNotificationStore {
    async fn targets(&self, recipient_id: Uuid, channel: Channel) -> Result<Vec<String>, AppError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT address FROM notification_targets
            WHERE recipient_id = $1 AND channel = $2 AND active
            ORDER BY created_at
            "#,
        )
        .bind(recipient_id)
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(address,)| address).collect())
    }

    async fn deactivate(&self, channel: Channel, address: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notification_targets
            SET active = false, deactivated_at = NOW()
            WHERE channel = $1 AND address = $2 AND active
            "#,
        )
        .bind(channel)
        .bind(address)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(channel = %channel, "Target deactivated");
        }
        Ok(())
    }
}
