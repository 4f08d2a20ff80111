use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use courier_common::types::Channel;

use super::{
    ChannelPayload, ChannelProvider, ChannelResult, DeliveryMeta, classify_http_status,
    retry_after_header,
};
use crate::error::ChannelError;

/// Maximum SMS length before truncation.
const MAX_SMS_CHARS: usize = 160;

/// Gateway status code for an accepted message.
const STATUS_OK: i64 = 100;

static NON_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^0-9]").expect("valid regex"));
static VALID_PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{9,14}$").expect("valid regex"));
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// SMS delivery through an SMS.RU-compatible HTTP gateway.
pub struct SmsProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    sender: String,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    status_code: i64,
    #[serde(default)]
    status_text: Option<String>,
    #[serde(default)]
    sms: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GatewayMessage {
    status_code: i64,
    #[serde(default)]
    sms_id: Option<String>,
    #[serde(default)]
    status_text: Option<String>,
}

impl SmsProvider {
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: &str, sender: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
            sender: sender.to_string(),
        }
    }

    /// Normalize to E.164. Russian numbers written as `9XXXXXXXXX` or
    /// `8XXXXXXXXXX` are rewritten to the `7` country code.
    pub fn normalize_phone(raw: &str) -> String {
        let digits = NON_DIGITS.replace_all(raw, "").into_owned();
        let digits = match (digits.len(), digits.chars().next()) {
            (10, Some('9')) => format!("7{digits}"),
            (11, Some('8')) => format!("7{}", &digits[1..]),
            _ => digits,
        };
        format!("+{digits}")
    }

    pub fn is_valid_phone(phone: &str) -> bool {
        VALID_PHONE.is_match(phone)
    }

    /// Plain-text SMS body: markup stripped, whitespace collapsed, deep link
    /// appended, truncated to a single message.
    pub fn prepare_text(payload: &ChannelPayload) -> String {
        let stripped = MARKUP.replace_all(&payload.body, " ");
        let decoded = decode_entities(&stripped);
        let mut text = WHITESPACE.replace_all(&decoded, " ").trim().to_string();

        if let Some(url) = &payload.click_action {
            text.push(' ');
            text.push_str(url);
        }

        if text.chars().count() > MAX_SMS_CHARS {
            text = text.chars().take(MAX_SMS_CHARS - 3).collect::<String>() + "...";
        }
        text
    }

    /// Map a gateway status code to the failure taxonomy.
    fn classify_status_code(code: i64, text: &str) -> ChannelError {
        let message = format!("gateway status {code}: {text}");
        match code {
            // Bad api_id / token / password, unconfirmed account.
            200 | 300 | 301 | 302 => ChannelError::Authentication(message),
            // Wrong recipient, number blocked, number in stop-list.
            202 | 207 | 209 => ChannelError::InvalidTarget(message),
            206 => ChannelError::RateLimited {
                message,
                retry_after: None,
            },
            // Insufficient funds, service temporarily unavailable.
            201 | 220 => ChannelError::Transient(message),
            _ => ChannelError::Unknown(message),
        }
    }

    async fn try_send(
        &self,
        target: &str,
        payload: &ChannelPayload,
    ) -> Result<String, ChannelError> {
        let phone = Self::normalize_phone(target);
        if !Self::is_valid_phone(&phone) {
            return Err(ChannelError::InvalidTarget(format!(
                "invalid phone number: {target}"
            )));
        }
        let text = Self::prepare_text(payload);

        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("api_id", self.api_key.as_str()),
                ("to", phone.as_str()),
                ("msg", text.as_str()),
                ("json", "1"),
                ("from", self.sender.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status("SMS gateway", status, retry_after, &body));
        }

        let parsed: GatewayResponse = response.json().await?;
        Self::interpret_response(parsed)
    }

    fn interpret_response(parsed: GatewayResponse) -> Result<String, ChannelError> {
        if parsed.status_code != STATUS_OK {
            return Err(Self::classify_status_code(
                parsed.status_code,
                parsed.status_text.as_deref().unwrap_or(""),
            ));
        }

        let message: GatewayMessage = parsed
            .sms
            .into_iter()
            .next()
            .map(|(_, v)| serde_json::from_value(v))
            .transpose()
            .map_err(|e| ChannelError::Unknown(format!("malformed gateway response: {e}")))?
            .ok_or_else(|| ChannelError::Unknown("gateway response without sms entry".into()))?;

        if message.status_code != STATUS_OK {
            return Err(Self::classify_status_code(
                message.status_code,
                message.status_text.as_deref().unwrap_or(""),
            ));
        }

        message
            .sms_id
            .ok_or_else(|| ChannelError::Unknown("gateway accepted message without sms_id".into()))
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[async_trait]
impl ChannelProvider for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult {
        match self.try_send(target, payload).await {
            Ok(sms_id) => ChannelResult::delivered(Some(sms_id)),
            Err(e) => {
                tracing::warn!(
                    notification_id = %meta.notification_id,
                    channel = %Channel::Sms,
                    error = %e,
                    "SMS delivery failed"
                );
                ChannelResult::from(e)
            }
        }
    }
}
