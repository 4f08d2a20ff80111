use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Serialize;
use uuid::Uuid;

use courier_common::types::{Channel, Priority};

use super::{ChannelPayload, ChannelProvider, ChannelResult, DeliveryMeta};
use crate::error::ChannelError;

/// In-app delivery. Messages are published on a per-recipient Redis channel
/// that the socket gateway subscribes to.
pub struct WebsocketProvider {
    redis: ConnectionManager,
}

#[derive(Debug, Serialize)]
struct SocketMessage<'a> {
    notification_id: Uuid,
    title: &'a str,
    body: &'a str,
    data: &'a serde_json::Value,
    priority: Priority,
    ttl_secs: u64,
}

impl WebsocketProvider {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub fn channel_name(recipient: &str) -> String {
        format!("notifications:user:{recipient}")
    }

    fn encode(payload: &ChannelPayload, meta: &DeliveryMeta) -> Result<String, ChannelError> {
        let message = SocketMessage {
            notification_id: meta.notification_id,
            title: &payload.title,
            body: &payload.body,
            data: &payload.data,
            priority: meta.priority,
            ttl_secs: meta.ttl.as_secs(),
        };
        serde_json::to_string(&message)
            .map_err(|e| ChannelError::Unknown(format!("failed to encode message: {e}")))
    }

    async fn try_send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> Result<String, ChannelError> {
        let body = Self::encode(payload, meta)?;
        let mut conn = self.redis.clone();

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(Self::channel_name(target))
            .arg(body)
            .query_async(&mut conn)
            .await?;

        // Offline recipients still count as delivered: the record stays in
        // the inbox and is picked up on the next connect.
        tracing::debug!(
            notification_id = %meta.notification_id,
            receivers,
            "Published in-app notification"
        );
        Ok(format!("ws-{}", Uuid::new_v4()))
    }
}

#[async_trait]
impl ChannelProvider for WebsocketProvider {
    fn channel(&self) -> Channel {
        Channel::Websocket
    }

    async fn send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult {
        match self.try_send(target, payload, meta).await {
            Ok(id) => ChannelResult::delivered(Some(id)),
            Err(e) => {
                tracing::warn!(
                    notification_id = %meta.notification_id,
                    channel = %Channel::Websocket,
                    error = %e,
                    "In-app delivery failed"
                );
                ChannelResult::from(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_channel_name() {
        let id = Uuid::nil();
        assert_eq!(
            WebsocketProvider::channel_name(&id.to_string()),
            "notifications:user:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_encode_message() {
        let payload = ChannelPayload {
            title: "Hello".to_string(),
            body: "World".to_string(),
            data: serde_json::json!({"k": "v"}),
            collapse_key: None,
            icon: None,
            click_action: None,
        };
        let meta = DeliveryMeta {
            notification_id: Uuid::nil(),
            recipient_id: Uuid::nil(),
            priority: Priority::High,
            ttl: Duration::from_secs(600),
        };
        let encoded = WebsocketProvider::encode(&payload, &meta).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["title"], "Hello");
        assert_eq!(value["priority"], "high");
        assert_eq!(value["ttl_secs"], 600);
        assert_eq!(value["data"]["k"], "v");
    }
}
