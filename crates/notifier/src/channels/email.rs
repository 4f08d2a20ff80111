use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use courier_common::types::Channel;

use super::{
    ChannelPayload, ChannelProvider, ChannelResult, DeliveryMeta, classify_http_status,
    retry_after_header,
};
use crate::error::ChannelError;

static EMAIL_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid email address regex")
});

/// Email delivery through the Resend HTTP API.
pub struct EmailProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

#[derive(Debug, Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: String,
}

#[derive(Debug, Deserialize)]
struct SendEmailResponse {
    id: String,
}

/// Resend error body, e.g. `{"statusCode":422,"name":"validation_error","message":"..."}`.
#[derive(Debug, Default, Deserialize)]
struct ResendError {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

impl EmailProvider {
    pub fn new(client: reqwest::Client, endpoint: &str, api_key: &str, from: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        }
    }

    pub fn is_valid_address(address: &str) -> bool {
        EMAIL_ADDRESS.is_match(address.trim())
    }

    fn render_text(payload: &ChannelPayload) -> String {
        match &payload.click_action {
            Some(url) => format!("{}\n\n{}", payload.body, url),
            None => payload.body.clone(),
        }
    }

    /// Classify a 422. Only recipient errors invalidate the target; a bad
    /// sender is a configuration problem shared by every recipient.
    fn classify_rejection(body: &str) -> ChannelError {
        let err: ResendError = serde_json::from_str(body).unwrap_or_default();
        let detail = if err.message.is_empty() {
            body.to_string()
        } else {
            err.message.clone()
        };

        if err.name == "invalid_from_address" || err.message.contains("`from`") {
            ChannelError::NotConfigured(format!("Resend rejected sender: {detail}"))
        } else if err.name == "invalid_to_address" || err.message.contains("`to`") {
            ChannelError::InvalidTarget(format!("Resend rejected recipient: {detail}"))
        } else {
            ChannelError::Rejected(format!("Resend: {detail}"))
        }
    }

    async fn try_send(
        &self,
        target: &str,
        payload: &ChannelPayload,
    ) -> Result<String, ChannelError> {
        let address = target.trim();
        if !Self::is_valid_address(address) {
            return Err(ChannelError::InvalidTarget(format!(
                "invalid email address: {target}"
            )));
        }

        let request = SendEmailRequest {
            from: &self.from,
            to: [address],
            subject: &payload.title,
            text: Self::render_text(payload),
        };

        let response = self
            .client
            .post(format!("{}/emails", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::UNPROCESSABLE_ENTITY {
                return Err(Self::classify_rejection(&body));
            }
            return Err(classify_http_status("Resend", status, retry_after, &body));
        }

        let parsed: SendEmailResponse = response.json().await?;
        Ok(parsed.id)
    }
}

#[async_trait]
impl ChannelProvider for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult {
        match self.try_send(target, payload).await {
            Ok(id) => ChannelResult::delivered(Some(id)),
            Err(e) => {
                tracing::warn!(
                    notification_id = %meta.notification_id,
                    channel = %Channel::Email,
                    error = %e,
                    "Email delivery failed"
                );
                ChannelResult::from(e)
            }
        }
    }
}
