//! Retry and TTL policy. Pure functions, no I/O.

use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_common::types::{Notification, Priority};

use crate::channels::ChannelResult;

/// Delay before the n-th retry, indexed by retries already performed.
/// The last entry repeats for every later retry.
pub const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(600),
];

pub fn compute_backoff(retry_count: u32) -> Duration {
    let idx = (retry_count as usize).min(BACKOFF_SCHEDULE.len() - 1);
    BACKOFF_SCHEDULE[idx]
}

/// Default message lifetime at the vendor when the notification has no expiry.
pub fn default_ttl(priority: Priority) -> Duration {
    match priority {
        Priority::Urgent => Duration::from_secs(3600),
        Priority::High => Duration::from_secs(24 * 3600),
        Priority::Medium => Duration::from_secs(3 * 24 * 3600),
        Priority::Low => Duration::from_secs(7 * 24 * 3600),
    }
}

/// Remaining lifetime until `expires_at` (never negative), or the priority default.
pub fn compute_ttl(
    priority: Priority,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    match expires_at {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        None => default_ttl(priority),
    }
}

pub fn should_retry(notification: &Notification, result: &ChannelResult, now: DateTime<Utc>) -> bool {
    if !notification.has_retry_budget() {
        return false;
    }
    if result.success || !result.retryable {
        return false;
    }
    !notification.is_expired(now)
}

/// Delay before the next attempt: the scheduled backoff, extended by the
/// largest vendor `retry_after` hint.
pub fn retry_delay(retry_count: u32, results: &[ChannelResult]) -> Duration {
    let backoff = compute_backoff(retry_count);
    results
        .iter()
        .filter_map(|r| r.retry_after)
        .fold(backoff, Duration::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use courier_common::types::{Channel, NotificationType};
    use uuid::Uuid;

    fn make_notification() -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationType::PaymentFailed,
            "Payment failed",
            "Please update your card",
            vec![Channel::Push],
        )
    }

    fn transient() -> ChannelResult {
        ChannelResult::failed("503", true)
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(compute_backoff(0), Duration::from_secs(30));
        assert_eq!(compute_backoff(1), Duration::from_secs(120));
        assert_eq!(compute_backoff(2), Duration::from_secs(600));
        assert_eq!(compute_backoff(3), Duration::from_secs(600));
        assert_eq!(compute_backoff(u32::MAX), Duration::from_secs(600));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        for n in 0..10 {
            assert!(compute_backoff(n) <= compute_backoff(n + 1));
        }
    }

    #[test]
    fn test_ttl_defaults_by_priority() {
        let now = Utc::now();
        assert_eq!(compute_ttl(Priority::Urgent, None, now), Duration::from_secs(3600));
        assert_eq!(compute_ttl(Priority::High, None, now), Duration::from_secs(86_400));
        assert_eq!(compute_ttl(Priority::Medium, None, now), Duration::from_secs(259_200));
        assert_eq!(compute_ttl(Priority::Low, None, now), Duration::from_secs(604_800));
    }

    #[test]
    fn test_ttl_from_expiry() {
        let now = Utc::now();
        let ttl = compute_ttl(Priority::Low, Some(now + ChronoDuration::seconds(120)), now);
        assert_eq!(ttl, Duration::from_secs(120));
    }

    #[test]
    fn test_ttl_never_negative() {
        let now = Utc::now();
        let ttl = compute_ttl(Priority::Urgent, Some(now - ChronoDuration::seconds(5)), now);
        assert_eq!(ttl, Duration::ZERO);
    }

    #[test]
    fn test_should_retry_transient_within_budget() {
        let n = make_notification();
        assert!(should_retry(&n, &transient(), Utc::now()));
    }

    #[test]
    fn test_should_not_retry_when_budget_exhausted() {
        let mut n = make_notification();
        n.retry_count = n.max_retries;
        assert!(!should_retry(&n, &transient(), Utc::now()));
    }

    #[test]
    fn test_should_not_retry_fatal() {
        let n = make_notification();
        assert!(!should_retry(&n, &ChannelResult::failed("bad key", false), Utc::now()));
    }

    #[test]
    fn test_should_not_retry_expired() {
        let now = Utc::now();
        let n = make_notification().with_expires_at(now - ChronoDuration::seconds(1));
        assert!(!should_retry(&n, &transient(), now));
    }

    #[test]
    fn test_retry_delay_honours_retry_after() {
        let mut limited = transient();
        limited.retry_after = Some(Duration::from_secs(900));
        assert_eq!(retry_delay(0, &[transient(), limited]), Duration::from_secs(900));

        let mut short = transient();
        short.retry_after = Some(Duration::from_secs(5));
        assert_eq!(retry_delay(1, &[short]), Duration::from_secs(120));
    }
}
