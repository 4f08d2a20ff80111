use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery medium a notification can be routed through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Sms,
    Email,
    /// In-app delivery over the websocket gateway.
    Websocket,
}

impl Channel {
    /// Default fan-out order used when no explicit order is configured.
    pub const DEFAULT_ORDER: [Channel; 4] =
        [Channel::Push, Channel::Sms, Channel::Email, Channel::Websocket];

    /// Whether the channel addresses a registered target (device token, phone,
    /// email) rather than the recipient id itself.
    pub fn requires_registered_target(&self) -> bool {
        !matches!(self, Channel::Websocket)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Push => write!(f, "push"),
            Channel::Sms => write!(f, "sms"),
            Channel::Email => write!(f, "email"),
            Channel::Websocket => write!(f, "websocket"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(Channel::Push),
            "sms" => Ok(Channel::Sms),
            "email" | "mail" => Ok(Channel::Email),
            "websocket" | "in_app" | "in-app" => Ok(Channel::Websocket),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Notification priority, drives TTL and provider-native priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Provider-native priority string (`"high"` or `"normal"`).
    pub fn provider_priority(&self) -> &'static str {
        match self {
            Priority::Urgent | Priority::High => "high",
            Priority::Medium | Priority::Low => "normal",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Urgent => write!(f, "urgent"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Lifecycle status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Cancelled,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "pending"),
            NotificationStatus::Sent => write!(f, "sent"),
            NotificationStatus::Delivered => write!(f, "delivered"),
            NotificationStatus::Read => write!(f, "read"),
            NotificationStatus::Failed => write!(f, "failed"),
            NotificationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Marketplace event that produced the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    // Bookings
    BookingCreated,
    BookingConfirmed,
    BookingCancelled,
    BookingReminder,
    BookingCompleted,

    // Payments
    PaymentCompleted,
    PaymentFailed,
    PaymentRefunded,

    // Ads
    AdApproved,
    AdRejected,
    AdExpired,

    // Reviews
    ReviewReceived,
    ReviewResponse,

    // System
    SystemMaintenance,
    SystemUpdate,

    // Communication
    ChatMessage,
    CallRequest,

    // Promotions
    PromoNew,
    PromoExpiring,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NotificationType::BookingCreated => "booking_created",
            NotificationType::BookingConfirmed => "booking_confirmed",
            NotificationType::BookingCancelled => "booking_cancelled",
            NotificationType::BookingReminder => "booking_reminder",
            NotificationType::BookingCompleted => "booking_completed",
            NotificationType::PaymentCompleted => "payment_completed",
            NotificationType::PaymentFailed => "payment_failed",
            NotificationType::PaymentRefunded => "payment_refunded",
            NotificationType::AdApproved => "ad_approved",
            NotificationType::AdRejected => "ad_rejected",
            NotificationType::AdExpired => "ad_expired",
            NotificationType::ReviewReceived => "review_received",
            NotificationType::ReviewResponse => "review_response",
            NotificationType::SystemMaintenance => "system_maintenance",
            NotificationType::SystemUpdate => "system_update",
            NotificationType::ChatMessage => "chat_message",
            NotificationType::CallRequest => "call_request",
            NotificationType::PromoNew => "promo_new",
            NotificationType::PromoExpiring => "promo_expiring",
        };
        write!(f, "{}", name)
    }
}

/// Status of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Canonical lifecycle record for a notification.
///
/// Transitions go through the methods in [`crate::lifecycle`]; fields are public
/// for persistence and read-only consumers.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub title: String,
    pub message: String,
    /// Structured payload forwarded to providers as `data`.
    pub data: serde_json::Value,
    #[sqlx(json)]
    pub channels: Vec<Channel>,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub group_key: Option<String>,
    /// Correlation id supplied by the producing system.
    pub external_id: Option<String>,
    /// Diagnostic notes (`failure_reason`, `failed_at`, `last_errors`, ...).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Default retry budget for new notifications.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

impl Notification {
    /// Build a new PENDING notification with the default priority and retry budget.
    pub fn new(
        recipient_id: Uuid,
        notification_type: NotificationType,
        title: impl Into<String>,
        message: impl Into<String>,
        channels: Vec<Channel>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            recipient_id,
            notification_type,
            status: NotificationStatus::Pending,
            title: title.into(),
            message: message.into(),
            data: serde_json::json!({}),
            channels,
            priority: Priority::default(),
            scheduled_at: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            expires_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            group_key: None,
            external_id: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    /// Optional deep link carried in the payload.
    pub fn action_url(&self) -> Option<&str> {
        self.data.get("action_url").and_then(|v| v.as_str())
    }
}

/// One provider call's recorded outcome for a (notification, channel) pair.
///
/// Attempts are append-only: a retry produces a new row, never an update.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    /// Device token, phone number, email address or recipient id.
    pub target: String,
    pub status: DeliveryStatus,
    pub external_id: Option<String>,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
