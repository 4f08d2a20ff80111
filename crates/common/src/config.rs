use serde::Deserialize;

use crate::types::Channel;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (job queue + in-app publisher)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// FCM server key for push delivery
    pub fcm_server_key: Option<String>,

    /// FCM send endpoint
    pub fcm_endpoint: String,

    /// SMS gateway API key
    pub sms_api_key: Option<String>,

    /// SMS sender name
    pub sms_sender: String,

    /// SMS gateway send endpoint
    pub sms_endpoint: String,

    /// Resend API key for email delivery
    pub resend_api_key: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,

    /// Resend API base URL
    pub resend_endpoint: String,

    /// Channel fan-out order (default: push, sms, email, websocket)
    pub channel_order: Vec<Channel>,

    /// Per provider call timeout in seconds (default: 10)
    pub provider_timeout_secs: u64,

    /// Pause the batch after this many dispatched items (default: 10)
    pub batch_throttle_every: usize,

    /// Length of the batch courtesy pause in milliseconds (default: 100)
    pub batch_throttle_pause_ms: u64,

    /// Wall-clock budget for one batch job in seconds (default: 300)
    pub batch_timeout_secs: u64,

    /// Maximum number of jobs executing at once in one worker (default: 8)
    pub worker_concurrency: usize,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            fcm_server_key: std::env::var("FCM_SERVER_KEY").ok(),
            fcm_endpoint: std::env::var("FCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com/fcm/send".to_string()),
            sms_api_key: std::env::var("SMS_API_KEY").ok(),
            sms_sender: std::env::var("SMS_SENDER").unwrap_or_else(|_| "COURIER".to_string()),
            sms_endpoint: std::env::var("SMS_ENDPOINT")
                .unwrap_or_else(|_| "https://sms.ru/sms/send".to_string()),
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            resend_endpoint: std::env::var("RESEND_ENDPOINT")
                .unwrap_or_else(|_| "https://api.resend.com".to_string()),
            channel_order: match std::env::var("CHANNEL_ORDER") {
                Ok(raw) => parse_channel_order(&raw).map_err(|e| anyhow::anyhow!(e))?,
                Err(_) => Channel::DEFAULT_ORDER.to_vec(),
            },
            provider_timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PROVIDER_TIMEOUT_SECS must be a valid u64"))?,
            batch_throttle_every: std::env::var("BATCH_THROTTLE_EVERY")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BATCH_THROTTLE_EVERY must be a valid usize"))?,
            batch_throttle_pause_ms: std::env::var("BATCH_THROTTLE_PAUSE_MS")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BATCH_THROTTLE_PAUSE_MS must be a valid u64"))?,
            batch_timeout_secs: std::env::var("BATCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("BATCH_TIMEOUT_SECS must be a valid u64"))?,
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_CONCURRENCY must be a valid usize"))?,
        })
    }
}

/// Parse a comma-separated channel list, dropping duplicates and keeping the
/// first occurrence. Channels missing from the list keep their default
/// relative order at the end.
pub fn parse_channel_order(raw: &str) -> Result<Vec<Channel>, String> {
    let mut order: Vec<Channel> = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let channel: Channel = part.parse()?;
        if !order.contains(&channel) {
            order.push(channel);
        }
    }
    for channel in Channel::DEFAULT_ORDER {
        if !order.contains(&channel) {
            order.push(channel);
        }
    }
    Ok(order)
}
