//! Channel providers.
//!
//! One provider per delivery medium:
//! - Push (FCM)
//! - SMS (SMS.RU-compatible gateway)
//! - Email (Resend HTTP API)
//! - WebSocket / in-app (Redis pub/sub, consumed by the socket gateway)
//!
//! Providers are looked up through a [`ProviderRegistry`] keyed by [`Channel`],
//! built once at startup from [`AppConfig`].

mod email;
mod push;
mod sms;
mod websocket;

pub use email::EmailProvider;
pub use push::PushProvider;
pub use sms::SmsProvider;
pub use websocket::WebsocketProvider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::types::{Channel, Notification, Priority};

use crate::error::ChannelError;

/// Outcome of one provider call. Folded into a `DeliveryAttempt` by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
    /// Vendor hint on when to try again (rate limiting).
    pub retry_after: Option<Duration>,
    /// The target is permanently unusable and must be deactivated.
    pub target_invalid: bool,
}

impl ChannelResult {
    pub fn delivered(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            retryable,
            ..Default::default()
        }
    }
}

impl From<ChannelError> for ChannelResult {
    fn from(err: ChannelError) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(err.to_string()),
            retryable: err.is_retryable(),
            retry_after: err.retry_after(),
            target_invalid: err.invalidates_target(),
        }
    }
}

/// Provider-independent message content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelPayload {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub collapse_key: Option<String>,
    pub icon: Option<String>,
    pub click_action: Option<String>,
}

impl ChannelPayload {
    /// Build the payload for a notification. Notifications in the same group
    /// collapse on the device; ungrouped ones collapse by type.
    pub fn from_notification(notification: &Notification) -> Self {
        let icon = notification
            .data
            .get("icon")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut data = notification.data.clone();
        if let Some(map) = data.as_object_mut() {
            map.insert(
                "notification_id".to_string(),
                serde_json::json!(notification.id),
            );
            map.insert(
                "type".to_string(),
                serde_json::json!(notification.notification_type.to_string()),
            );
        }

        Self {
            title: notification.title.clone(),
            body: notification.message.clone(),
            data,
            collapse_key: Some(
                notification
                    .group_key
                    .clone()
                    .unwrap_or_else(|| notification.notification_type.to_string()),
            ),
            icon,
            click_action: notification.action_url().map(str::to_string),
        }
    }
}

/// Per-call delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryMeta {
    pub notification_id: Uuid,
    pub recipient_id: Uuid,
    pub priority: Priority,
    /// Precomputed time-to-live of the message at the vendor.
    pub ttl: Duration,
}

/// Sends one delivery attempt through a specific medium.
///
/// Implementations must not fail on transient problems: every outcome,
/// including transport errors, is reported as a [`ChannelResult`].
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// The channel this provider serves.
    fn channel(&self) -> Channel;

    async fn send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult;
}

/// Channel -> provider lookup, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own channel, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn ChannelProvider>) {
        self.providers.insert(provider.channel(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.get(&channel).cloned()
    }

    pub fn has_provider(&self, channel: Channel) -> bool {
        self.providers.contains_key(&channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.providers.keys().copied().collect();
        channels.sort();
        channels
    }

    /// Build the production registry. Channels without credentials are left
    /// unregistered and fail non-retryably at dispatch time.
    pub fn from_config(config: &AppConfig, redis: ConnectionManager) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.provider_timeout_secs))
            .connect_timeout(Duration::from_secs(config.provider_timeout_secs.min(5)))
            .build()?;

        let mut registry = Self::new();

        match &config.fcm_server_key {
            Some(key) => registry.register(Arc::new(PushProvider::new(
                client.clone(),
                &config.fcm_endpoint,
                key,
            ))),
            None => tracing::warn!(channel = %Channel::Push, "FCM_SERVER_KEY not set, channel disabled"),
        }

        match &config.sms_api_key {
            Some(key) => registry.register(Arc::new(SmsProvider::new(
                client.clone(),
                &config.sms_endpoint,
                key,
                &config.sms_sender,
            ))),
            None => tracing::warn!(channel = %Channel::Sms, "SMS_API_KEY not set, channel disabled"),
        }

        match (&config.resend_api_key, &config.email_from) {
            (Some(key), Some(from)) => registry.register(Arc::new(EmailProvider::new(
                client,
                &config.resend_endpoint,
                key,
                from,
            ))),
            _ => tracing::warn!(
                channel = %Channel::Email,
                "RESEND_API_KEY or EMAIL_FROM not set, channel disabled"
            ),
        }

        registry.register(Arc::new(WebsocketProvider::new(redis)));

        tracing::info!(channels = ?registry.channels(), "Channel providers registered");
        Ok(registry)
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a non-success HTTP status from a vendor API.
pub(crate) fn classify_http_status(
    service: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ChannelError {
    let message = format!("{service} returned {status}: {}", truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::Authentication(message),
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited {
            message,
            retry_after,
        },
        s if s.is_server_error() => match retry_after {
            Some(_) => ChannelError::RateLimited {
                message,
                retry_after,
            },
            None => ChannelError::Transient(message),
        },
        _ => ChannelError::Unknown(message),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect::<String>() + "..."
    }
}
