//! Notification lifecycle state machine.
//!
//! ```text
//! PENDING --dispatch success--> SENT --receipt--> DELIVERED --opened--> READ
//! PENDING --retries exhausted--> FAILED
//! PENDING --expired--> CANCELLED
//! ```
//!
//! Every transition goes through a method on [`Notification`] so the timestamp
//! invariants (`sent_at` only on sent/delivered/read, `sent_at <= delivered_at`,
//! `retry_count <= max_retries`) hold for any value that left this module.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Notification, NotificationStatus};

/// Rejected state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: NotificationStatus,
        to: NotificationStatus,
    },

    #[error("retry budget exhausted ({retry_count}/{max_retries})")]
    RetriesExhausted { retry_count: i32, max_retries: i32 },
}

impl NotificationStatus {
    /// Whether the state machine accepts `self -> next`.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Sent, Delivered)
                | (Delivered, Read)
        )
    }

    /// Terminal for the dispatch path (only receipts move SENT/DELIVERED on).
    pub fn is_final_for_dispatch(self) -> bool {
        !matches!(self, NotificationStatus::Pending)
    }
}

impl Notification {
    pub fn is_pending(&self) -> bool {
        self.status == NotificationStatus::Pending
    }

    /// Expired when `expires_at` is at or before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Due when unscheduled or scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Whether another dispatch attempt is still within budget.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn transition(
        &mut self,
        next: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// PENDING -> SENT.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Sent, now)?;
        self.sent_at = Some(now);
        Ok(())
    }

    /// SENT -> DELIVERED. `delivered_at` is clamped so it never precedes `sent_at`.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Delivered, at)?;
        let delivered_at = match self.sent_at {
            Some(sent_at) if sent_at > at => sent_at,
            _ => at,
        };
        self.delivered_at = Some(delivered_at);
        Ok(())
    }

    /// DELIVERED -> READ. A read of a SENT notification implies delivery first.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status == NotificationStatus::Sent {
            self.mark_delivered(at)?;
        }
        self.transition(NotificationStatus::Read, at)?;
        self.read_at = Some(self.delivered_at.map_or(at, |d| d.max(at)));
        Ok(())
    }

    /// PENDING -> FAILED, keeping the reason in `metadata`.
    pub fn mark_failed(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Failed, now)?;
        self.set_metadata("failure_reason", serde_json::json!(reason));
        self.set_metadata("failed_at", serde_json::json!(now.to_rfc3339()));
        Ok(())
    }

    /// PENDING -> CANCELLED.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(NotificationStatus::Cancelled, now)?;
        self.set_metadata("cancel_reason", serde_json::json!(reason));
        self.set_metadata("cancelled_at", serde_json::json!(now.to_rfc3339()));
        Ok(())
    }

    /// Consume one unit of retry budget; status stays PENDING.
    pub fn record_retry(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.is_pending() {
            return Err(TransitionError::Illegal {
                from: self.status,
                to: NotificationStatus::Pending,
            });
        }
        if !self.has_retry_budget() {
            return Err(TransitionError::RetriesExhausted {
                retry_count: self.retry_count,
                max_retries: self.max_retries,
            });
        }
        self.retry_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Insert a key into the `metadata` object, replacing a non-object value.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Check the data-model invariants, returning the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.retry_count < 0 || self.retry_count > self.max_retries {
            return Err(format!(
                "retry_count {} outside 0..={}",
                self.retry_count, self.max_retries
            ));
        }
        let sent_like = matches!(
            self.status,
            NotificationStatus::Sent | NotificationStatus::Delivered | NotificationStatus::Read
        );
        if self.sent_at.is_some() && !sent_like {
            return Err(format!("sent_at set while status is {}", self.status));
        }
        if let Some(delivered_at) = self.delivered_at {
            match self.sent_at {
                None => return Err("delivered_at set without sent_at".to_string()),
                Some(sent_at) if sent_at > delivered_at => {
                    return Err("delivered_at precedes sent_at".to_string());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, NotificationType};
    use chrono::Duration;
    use uuid::Uuid;

    fn make_notification() -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationType::BookingConfirmed,
            "Booking confirmed",
            "Your booking is confirmed",
            vec![Channel::Push, Channel::Email],
        )
    }

    #[test]
    fn test_pending_to_sent_sets_sent_at() {
        let mut n = make_notification();
        let now = Utc::now();
        n.mark_sent(now).unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.sent_at, Some(now));
        assert!(n.check_invariants().is_ok());
    }

    #[test]
    fn test_full_happy_path() {
        let mut n = make_notification();
        let t0 = Utc::now();
        n.mark_sent(t0).unwrap();
        n.mark_delivered(t0 + Duration::seconds(5)).unwrap();
        n.mark_read(t0 + Duration::seconds(60)).unwrap();
        assert_eq!(n.status, NotificationStatus::Read);
        assert!(n.delivered_at.unwrap() >= n.sent_at.unwrap());
        assert!(n.check_invariants().is_ok());
    }

    #[test]
    fn test_delivered_at_never_precedes_sent_at() {
        let mut n = make_notification();
        let t0 = Utc::now();
        n.mark_sent(t0).unwrap();
        // Provider clock skew: receipt timestamped before our send.
        n.mark_delivered(t0 - Duration::seconds(3)).unwrap();
        assert_eq!(n.delivered_at, Some(t0));
        assert!(n.check_invariants().is_ok());
    }

    #[test]
    fn test_read_of_sent_implies_delivery() {
        let mut n = make_notification();
        let t0 = Utc::now();
        n.mark_sent(t0).unwrap();
        n.mark_read(t0 + Duration::seconds(1)).unwrap();
        assert_eq!(n.status, NotificationStatus::Read);
        assert!(n.delivered_at.is_some());
        assert!(n.read_at.is_some());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let now = Utc::now();

        let mut failed = make_notification();
        failed.mark_failed("boom", now).unwrap();
        assert!(failed.mark_sent(now).is_err());
        assert!(failed.cancel("late", now).is_err());

        let mut cancelled = make_notification();
        cancelled.cancel("expired", now).unwrap();
        assert!(cancelled.mark_sent(now).is_err());
        assert!(cancelled.mark_failed("x", now).is_err());

        let mut read = make_notification();
        read.mark_sent(now).unwrap();
        read.mark_read(now).unwrap();
        assert!(read.mark_delivered(now).is_err());
    }

    #[test]
    fn test_pending_cannot_skip_to_delivered() {
        let mut n = make_notification();
        let err = n.mark_delivered(Utc::now()).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Illegal {
                from: NotificationStatus::Pending,
                to: NotificationStatus::Delivered,
            }
        );
    }

    #[test]
    fn test_record_retry_respects_budget() {
        let mut n = make_notification().with_max_retries(2);
        let now = Utc::now();
        n.record_retry(now).unwrap();
        n.record_retry(now).unwrap();
        assert_eq!(n.retry_count, 2);
        assert!(matches!(
            n.record_retry(now),
            Err(TransitionError::RetriesExhausted { .. })
        ));
        assert_eq!(n.retry_count, 2);
        assert!(n.check_invariants().is_ok());
    }

    #[test]
    fn test_mark_failed_records_reason() {
        let mut n = make_notification();
        n.mark_failed("Max retries exceeded", Utc::now()).unwrap();
        assert_eq!(n.metadata["failure_reason"], "Max retries exceeded");
        assert!(n.metadata.get("failed_at").is_some());
    }

    #[test]
    fn test_expiry_and_schedule_checks() {
        let now = Utc::now();
        let n = make_notification().with_expires_at(now - Duration::seconds(1));
        assert!(n.is_expired(now));

        let n = make_notification().with_expires_at(now + Duration::seconds(120));
        assert!(!n.is_expired(now));

        let n = make_notification().with_scheduled_at(now + Duration::minutes(5));
        assert!(!n.is_due(now));
        assert!(make_notification().is_due(now));
    }
}
