use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::lifecycle::TransitionError;

/// Failure of a single provider call, classified for retry decisions.
///
/// Providers never surface these to their caller: every variant is folded into
/// a [`crate::channels::ChannelResult`] before leaving the provider.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Bad or revoked credentials. Fatal for every target.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Target is malformed or no longer registered with the vendor.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Vendor throttled us; `retry_after` carries the vendor hint when present.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Network failure or vendor-side outage.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Vendor refused the message itself; resending it unchanged cannot succeed.
    #[error("message rejected: {0}")]
    Rejected(String),

    /// No provider or credentials configured for the channel.
    #[error("channel not configured: {0}")]
    NotConfigured(String),

    /// Anything the vendor response did not let us classify.
    #[error("unexpected provider response: {0}")]
    Unknown(String),
}

impl ChannelError {
    /// Unknown failures default to retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ChannelError::Authentication(_)
                | ChannelError::InvalidTarget(_)
                | ChannelError::Rejected(_)
                | ChannelError::NotConfigured(_)
        )
    }

    /// Whether the target should be deactivated in the target registry.
    pub fn invalidates_target(&self) -> bool {
        matches!(self, ChannelError::InvalidTarget(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ChannelError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors that escape the dispatch boundary. Channel failures never do.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] AppError),

    /// The stored record breaks a data-model invariant.
    #[error("invalid notification {id}: {reason}")]
    InvalidNotification { id: Uuid, reason: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl DispatchError {
    /// Storage hiccups are worth another attempt; invariant violations are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}
