use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use courier_common::types::Channel;

use super::{
    ChannelPayload, ChannelProvider, ChannelResult, DeliveryMeta, classify_http_status,
    retry_after_header,
};
use crate::error::ChannelError;

/// FCM refuses TTLs above four weeks.
const MAX_FCM_TTL_SECS: u64 = 2_419_200;

/// Push delivery through the FCM HTTP endpoint.
pub struct PushProvider {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

#[derive(Debug, Deserialize)]
struct FcmResponse {
    #[serde(default)]
    results: Vec<FcmResult>,
}

#[derive(Debug, Deserialize)]
struct FcmResult {
    message_id: Option<String>,
    error: Option<String>,
}

impl PushProvider {
    pub fn new(client: reqwest::Client, endpoint: &str, server_key: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            server_key: server_key.to_string(),
        }
    }

    /// Request body in the FCM legacy shape.
    fn build_body(target: &str, payload: &ChannelPayload, meta: &DeliveryMeta) -> Value {
        let mut notification = json!({
            "title": payload.title,
            "body": payload.body,
        });
        if let Some(icon) = &payload.icon {
            notification["icon"] = json!(icon);
        }
        if let Some(action) = &payload.click_action {
            notification["click_action"] = json!(action);
        }

        let mut body = json!({
            "to": target,
            "notification": notification,
            "data": payload.data,
            "priority": meta.priority.provider_priority(),
            "time_to_live": meta.ttl.as_secs().min(MAX_FCM_TTL_SECS),
        });
        if let Some(key) = &payload.collapse_key {
            body["collapse_key"] = json!(key);
        }
        body
    }

    /// Map an FCM per-message error code.
    fn classify_result_error(code: &str) -> ChannelError {
        match code {
            "NotRegistered" | "InvalidRegistration" | "MismatchSenderId" | "MissingRegistration" => {
                ChannelError::InvalidTarget(code.to_string())
            }
            "Unavailable" | "InternalServerError" | "DeviceMessageRateExceeded"
            | "TopicsMessageRateExceeded" => ChannelError::Transient(code.to_string()),
            "MessageTooBig" | "InvalidDataKey" | "InvalidTtl" | "InvalidPackageName" => {
                ChannelError::Rejected(code.to_string())
            }
            other => ChannelError::Unknown(other.to_string()),
        }
    }

    async fn try_send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> Result<String, ChannelError> {
        let body = Self::build_body(target, payload, meta);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(classify_http_status("FCM", status, retry_after, &text));
        }

        let parsed: FcmResponse = response.json().await?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ChannelError::Unknown("FCM response without results".to_string()))?;

        match (result.message_id, result.error) {
            (Some(message_id), _) => Ok(message_id),
            (None, Some(code)) => Err(Self::classify_result_error(&code)),
            (None, None) => Err(ChannelError::Unknown(
                "FCM result without message_id or error".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ChannelProvider for PushProvider {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult {
        match self.try_send(target, payload, meta).await {
            Ok(message_id) => ChannelResult::delivered(Some(message_id)),
            Err(e) => {
                tracing::warn!(
                    notification_id = %meta.notification_id,
                    channel = %Channel::Push,
                    error = %e,
                    "Push delivery failed"
                );
                ChannelResult::from(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::types::Priority;
    use std::time::Duration;
    use uuid::Uuid;

    fn make_payload() -> ChannelPayload {
        ChannelPayload {
            title: "Booking confirmed".to_string(),
            body: "See you tomorrow at 10:00".to_string(),
            data: json!({"booking_id": 7}),
            collapse_key: Some("booking_confirmed".to_string()),
            icon: Some("ic_booking".to_string()),
            click_action: Some("OPEN_BOOKING".to_string()),
        }
    }

    fn make_meta(priority: Priority, ttl: Duration) -> DeliveryMeta {
        DeliveryMeta {
            notification_id: Uuid::new_v4(),
            recipient_id: Uuid::new_v4(),
            priority,
            ttl,
        }
    }

    #[test]
    fn test_build_body_shape() {
        let body = PushProvider::build_body(
            "device-token-1",
            &make_payload(),
            &make_meta(Priority::Urgent, Duration::from_secs(3600)),
        );
        assert_eq!(body["to"], "device-token-1");
        assert_eq!(body["notification"]["title"], "Booking confirmed");
        assert_eq!(body["notification"]["icon"], "ic_booking");
        assert_eq!(body["notification"]["click_action"], "OPEN_BOOKING");
        assert_eq!(body["data"]["booking_id"], 7);
        assert_eq!(body["collapse_key"], "booking_confirmed");
        assert_eq!(body["priority"], "high");
        assert_eq!(body["time_to_live"], 3600);
    }

    #[test]
    fn test_build_body_normal_priority_and_ttl_cap() {
        let body = PushProvider::build_body(
            "t",
            &make_payload(),
            &make_meta(Priority::Low, Duration::from_secs(90 * 24 * 3600)),
        );
        assert_eq!(body["priority"], "normal");
        assert_eq!(body["time_to_live"], MAX_FCM_TTL_SECS);
    }

    #[test]
    fn test_classify_result_errors() {
        assert!(PushProvider::classify_result_error("NotRegistered").invalidates_target());
        assert!(PushProvider::classify_result_error("InvalidRegistration").invalidates_target());
        let unavailable = PushProvider::classify_result_error("Unavailable");
        assert!(unavailable.is_retryable());
        assert!(!unavailable.invalidates_target());
        assert!(PushProvider::classify_result_error("SomethingNew").is_retryable());
        let too_big = PushProvider::classify_result_error("MessageTooBig");
        assert!(!too_big.is_retryable());
        assert!(!too_big.invalidates_target());
    }

    #[test]
    fn test_parse_fcm_response() {
        let parsed: FcmResponse = serde_json::from_str(
            r#"{"multicast_id":1,"success":0,"failure":1,"results":[{"error":"NotRegistered"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].error.as_deref(), Some("NotRegistered"));
        assert!(parsed.results[0].message_id.is_none());
    }
}
