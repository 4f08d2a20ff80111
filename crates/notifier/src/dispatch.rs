//! Notification dispatch service.
//!
//! Fans one notification out over its channels in the configured order,
//! records every provider call, and folds the outcomes into a single state
//! transition:
//!
//! - at least one channel delivered: SENT
//! - nothing delivered but a retryable failure within budget: stays PENDING,
//!   `retry_count + 1`, next attempt after the backoff
//! - otherwise: FAILED
//!
//! Channel failures never escape this module. Only storage errors and
//! invariant violations surface as [`DispatchError`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::config::AppConfig;
use courier_common::error::AppError;
use courier_common::types::{Channel, Notification, NotificationStatus};

use crate::channels::{ChannelPayload, ChannelProvider, ChannelResult, DeliveryMeta, ProviderRegistry};
use crate::delivery::DeliveryRecorder;
use crate::error::{ChannelError, DispatchError};
use crate::policy::{compute_ttl, retry_delay, should_retry};
use crate::store::{NotificationRepository, TargetRegistry};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Fan-out order. Channels of a notification missing here go last.
    pub channel_order: Vec<Channel>,
    /// Upper bound on a single provider call.
    pub call_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_order: Channel::DEFAULT_ORDER.to_vec(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AppConfig> for DispatchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            channel_order: config.channel_order.clone(),
            // Slightly above the HTTP client timeout so the vendor error wins.
            call_timeout: Duration::from_secs(config.provider_timeout_secs + 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    NotPending(NotificationStatus),
    /// Expired before sending; the notification was cancelled.
    Expired,
    /// Scheduled for later.
    NotDue { scheduled_at: DateTime<Utc> },
    /// Another writer moved the notification out of PENDING mid-dispatch.
    Superseded,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotFound => write!(f, "not found"),
            SkipReason::NotPending(status) => write!(f, "status is {}", status),
            SkipReason::Expired => write!(f, "expired"),
            SkipReason::NotDue { scheduled_at } => write!(f, "not due until {}", scheduled_at),
            SkipReason::Superseded => write!(f, "changed by another writer"),
        }
    }
}

/// State the notification was left in after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Sent,
    Retry { retry_count: i32, backoff: Duration },
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub notification_id: Uuid,
    /// Channel -> delivered on at least one target.
    pub channels: BTreeMap<Channel, bool>,
    pub success: bool,
    pub failures: Vec<String>,
    pub disposition: Disposition,
}

#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Skipped {
        notification_id: Uuid,
        reason: SkipReason,
    },
    Dispatched(DispatchReport),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Dispatched(r) if r.success)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DeliveryOutcome::Skipped { .. })
    }

    /// Backoff before the next attempt, when the notification was kept for retry.
    pub fn retry_backoff(&self) -> Option<Duration> {
        match self {
            DeliveryOutcome::Dispatched(DispatchReport {
                disposition: Disposition::Retry { backoff, .. },
                ..
            }) => Some(*backoff),
            _ => None,
        }
    }

    /// Delay before the notification should be dispatched again: the retry
    /// backoff, or the time left until a future `scheduled_at`.
    pub fn requeue_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            DeliveryOutcome::Skipped {
                reason: SkipReason::NotDue { scheduled_at },
                ..
            } => Some((*scheduled_at - now).to_std().unwrap_or(Duration::ZERO)),
            _ => self.retry_backoff(),
        }
    }
}

#[derive(Clone)]
pub struct DispatchService {
    repo: Arc<dyn NotificationRepository>,
    targets: Arc<dyn TargetRegistry>,
    recorder: DeliveryRecorder,
    providers: ProviderRegistry,
    config: DispatchConfig,
}

impl DispatchService {
    pub fn new(
        repo: Arc<dyn NotificationRepository>,
        targets: Arc<dyn TargetRegistry>,
        providers: ProviderRegistry,
        config: DispatchConfig,
    ) -> Self {
        let recorder = DeliveryRecorder::new(repo.clone(), targets.clone());
        Self {
            repo,
            targets,
            recorder,
            providers,
            config,
        }
    }

    pub fn repository(&self) -> &Arc<dyn NotificationRepository> {
        &self.repo
    }

    pub fn recorder(&self) -> &DeliveryRecorder {
        &self.recorder
    }

    /// Load and dispatch one notification by id.
    pub async fn dispatch(&self, id: Uuid) -> Result<DeliveryOutcome, DispatchError> {
        let Some(mut notification) = self.repo.find(id).await? else {
            tracing::debug!(notification_id = %id, "Notification not found, skipping");
            return Ok(DeliveryOutcome::Skipped {
                notification_id: id,
                reason: SkipReason::NotFound,
            });
        };
        self.dispatch_notification(&mut notification).await
    }

    /// Dispatch an already loaded notification and persist the result.
    pub async fn dispatch_notification(
        &self,
        notification: &mut Notification,
    ) -> Result<DeliveryOutcome, DispatchError> {
        let now = Utc::now();
        let id = notification.id;

        if !notification.is_pending() {
            tracing::debug!(notification_id = %id, status = %notification.status, "Not pending, skipping");
            return Ok(DeliveryOutcome::Skipped {
                notification_id: id,
                reason: SkipReason::NotPending(notification.status),
            });
        }

        if notification.is_expired(now) {
            notification.cancel("expired before sending", now)?;
            if !self.persist(notification).await? {
                return Ok(superseded(id));
            }
            tracing::info!(notification_id = %id, "Notification expired, cancelled");
            return Ok(DeliveryOutcome::Skipped {
                notification_id: id,
                reason: SkipReason::Expired,
            });
        }

        if let Some(scheduled_at) = notification.scheduled_at.filter(|_| !notification.is_due(now)) {
            tracing::debug!(notification_id = %id, scheduled_at = %scheduled_at, "Not due yet, skipping");
            return Ok(DeliveryOutcome::Skipped {
                notification_id: id,
                reason: SkipReason::NotDue { scheduled_at },
            });
        }

        if notification.channels.is_empty() {
            return Err(DispatchError::InvalidNotification {
                id,
                reason: "no channels".to_string(),
            });
        }
        notification
            .check_invariants()
            .map_err(|reason| DispatchError::InvalidNotification { id, reason })?;

        let payload = ChannelPayload::from_notification(notification);
        let meta = DeliveryMeta {
            notification_id: id,
            recipient_id: notification.recipient_id,
            priority: notification.priority,
            ttl: compute_ttl(notification.priority, notification.expires_at, now),
        };

        let mut channels = BTreeMap::new();
        let mut failures = Vec::new();
        let mut results = Vec::new();

        for channel in self.ordered_channels(&notification.channels) {
            let channel_results = self
                .deliver_channel(notification, channel, &payload, &meta)
                .await?;

            let delivered = channel_results.iter().any(|r| r.success);
            channels.insert(channel, delivered);
            failures.extend(
                channel_results
                    .iter()
                    .filter(|r| !r.success)
                    .map(|r| format!("{}: {}", channel, r.error.as_deref().unwrap_or("unknown error"))),
            );
            results.extend(channel_results);
        }

        let success = channels.values().any(|delivered| *delivered);
        let now = Utc::now();

        let disposition = if success {
            notification.mark_sent(now)?;
            Disposition::Sent
        } else if results.iter().any(|r| should_retry(notification, r, now)) {
            let performed = u32::try_from(notification.retry_count).unwrap_or(0);
            let backoff = retry_delay(performed, &results);
            notification.record_retry(now)?;
            Disposition::Retry {
                retry_count: notification.retry_count,
                backoff,
            }
        } else {
            let reason = if !notification.has_retry_budget() && results.iter().any(|r| r.retryable) {
                "Max retries exceeded".to_string()
            } else {
                failures.join("; ")
            };
            notification.mark_failed(&reason, now)?;
            Disposition::Failed { reason }
        };

        if !failures.is_empty() {
            notification.set_metadata("last_errors", serde_json::json!(failures));
        }
        if !self.persist(notification).await? {
            return Ok(superseded(id));
        }

        match &disposition {
            Disposition::Sent => tracing::info!(
                notification_id = %id,
                channels = ?channels,
                "Notification sent"
            ),
            Disposition::Retry { retry_count, backoff } => tracing::info!(
                notification_id = %id,
                retry_count,
                backoff_secs = backoff.as_secs(),
                "Delivery failed, retry scheduled"
            ),
            Disposition::Failed { reason } => tracing::warn!(
                notification_id = %id,
                reason = %reason,
                "Notification failed"
            ),
        }

        Ok(DeliveryOutcome::Dispatched(DispatchReport {
            notification_id: id,
            channels,
            success,
            failures,
            disposition,
        }))
    }

    /// Save a notification that was PENDING when loaded. Returns `false`
    /// when another writer changed it in the meantime; its state wins.
    async fn persist(&self, notification: &Notification) -> Result<bool, DispatchError> {
        match self.repo.save(notification, NotificationStatus::Pending).await {
            Ok(()) => Ok(true),
            Err(AppError::Conflict(reason)) => {
                tracing::warn!(
                    notification_id = %notification.id,
                    reason = %reason,
                    "Notification changed during dispatch, result discarded"
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Notification channels in configured order, deduplicated.
    fn ordered_channels(&self, requested: &[Channel]) -> Vec<Channel> {
        let mut ordered: Vec<Channel> = self
            .config
            .channel_order
            .iter()
            .copied()
            .filter(|c| requested.contains(c))
            .collect();
        for channel in requested {
            if !ordered.contains(channel) {
                ordered.push(*channel);
            }
        }
        ordered
    }

    /// One channel: resolve targets, call the provider for each, record each call.
    async fn deliver_channel(
        &self,
        notification: &Notification,
        channel: Channel,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> Result<Vec<ChannelResult>, DispatchError> {
        let Some(provider) = self.providers.get(channel) else {
            tracing::warn!(notification_id = %notification.id, channel = %channel, "No provider configured");
            return Ok(vec![
                ChannelError::NotConfigured("no provider registered".to_string()).into(),
            ]);
        };

        let targets = if channel.requires_registered_target() {
            match self.targets.targets(notification.recipient_id, channel).await {
                Ok(targets) => targets,
                Err(e) => {
                    tracing::warn!(
                        notification_id = %notification.id,
                        channel = %channel,
                        error = %e,
                        "Target lookup failed"
                    );
                    return Ok(vec![ChannelResult::failed(
                        format!("target lookup failed: {e}"),
                        true,
                    )]);
                }
            }
        } else {
            vec![notification.recipient_id.to_string()]
        };

        if targets.is_empty() {
            tracing::debug!(notification_id = %notification.id, channel = %channel, "No active targets");
            return Ok(vec![ChannelResult::failed("no active target", false)]);
        }

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = self
                .call_provider(provider.clone(), &target, payload, meta)
                .await;
            self.recorder
                .record_attempt(notification.id, channel, &target, &result, Utc::now())
                .await?;
            results.push(result);
        }
        Ok(results)
    }

    /// Run one provider call on its own task, bounded by the call timeout.
    /// A panic or timeout becomes a retryable failed result.
    async fn call_provider(
        &self,
        provider: Arc<dyn ChannelProvider>,
        target: &str,
        payload: &ChannelPayload,
        meta: &DeliveryMeta,
    ) -> ChannelResult {
        let channel = provider.channel();
        let target = target.to_string();
        let payload = payload.clone();
        let meta = meta.clone();
        let notification_id = meta.notification_id;

        let handle =
            tokio::spawn(async move { provider.send(&target, &payload, &meta).await });

        match tokio::time::timeout(self.config.call_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::error!(
                    notification_id = %notification_id,
                    channel = %channel,
                    error = %e,
                    "Provider task crashed"
                );
                ChannelResult::failed(format!("provider crashed: {e}"), true)
            }
            Err(_) => {
                tracing::warn!(
                    notification_id = %notification_id,
                    channel = %channel,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "Provider call timed out"
                );
                ChannelResult::failed(
                    format!("provider call timed out after {:?}", self.config.call_timeout),
                    true,
                )
            }
        }
    }
}

fn superseded(notification_id: Uuid) -> DeliveryOutcome {
    DeliveryOutcome::Skipped {
        notification_id,
        reason: SkipReason::Superseded,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Behavior, ScriptedProvider};
    use super::*;
    use crate::store::InMemoryNotificationStore;
    use chrono::Duration as ChronoDuration;
    use courier_common::types::{DeliveryStatus, NotificationType, Priority};

    fn make_notification(channels: Vec<Channel>) -> Notification {
        Notification::new(
            Uuid::new_v4(),
            NotificationType::BookingConfirmed,
            "Booking confirmed",
            "See you tomorrow",
            channels,
        )
    }

    fn make_service(
        store: &Arc<InMemoryNotificationStore>,
        providers: Vec<Arc<ScriptedProvider>>,
    ) -> DispatchService {
        let mut registry = ProviderRegistry::new();
        for p in providers {
            registry.register(p);
        }
        DispatchService::new(
            store.clone(),
            store.clone(),
            registry,
            DispatchConfig {
                call_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    async fn seed(store: &InMemoryNotificationStore, notification: &Notification) {
        for channel in &notification.channels {
            let address = match channel {
                Channel::Push => "device-token",
                Channel::Sms => "+79161234567",
                Channel::Email => "user@example.com",
                Channel::Websocket => continue,
            };
            store.add_target(notification.recipient_id, *channel, address);
        }
        store.insert(notification).await.unwrap();
    }

    fn report(outcome: DeliveryOutcome) -> DispatchReport {
        match outcome {
            DeliveryOutcome::Dispatched(report) => report,
            other => panic!("expected dispatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_high_priority_push_success() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push]).with_priority(Priority::High);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert!(report.success);
        assert_eq!(report.disposition, Disposition::Sent);
        assert_eq!(report.channels, BTreeMap::from([(Channel::Push, true)]));

        let stored = store.get(n.id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, DeliveryStatus::Sent);
        assert_eq!(attempts[0].external_id.as_deref(), Some("ext-device-token"));
        assert_eq!(push.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_channel_does_not_block_others() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Panic);
        let sms = ScriptedProvider::new(Channel::Sms, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone(), sms.clone()]);

        let n = make_notification(vec![Channel::Push, Channel::Sms]);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert!(report.success);
        assert!(!report.channels[&Channel::Push]);
        assert!(report.channels[&Channel::Sms]);
        assert!(report.failures[0].starts_with("push: provider crashed"));
        assert_eq!(sms.calls(), 1);

        let attempts = store.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_timeout_becomes_retryable_failure() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Hang);
        let service = make_service(&store, vec![push]);

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        let outcome = service.dispatch(n.id).await.unwrap();
        assert_eq!(outcome.retry_backoff(), Some(Duration::from_secs(30)));
        let report = report(outcome);
        assert!(report.failures[0].contains("timed out"));
    }

    #[tokio::test]
    async fn test_dispatch_is_noop_after_sent() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        service.dispatch(n.id).await.unwrap();
        let before = store.get(n.id).unwrap();
        let second = service.dispatch(n.id).await.unwrap();

        assert!(matches!(
            second,
            DeliveryOutcome::Skipped {
                reason: SkipReason::NotPending(NotificationStatus::Sent),
                ..
            }
        ));
        assert_eq!(push.calls(), 1);
        assert_eq!(store.attempts().len(), 1);
        assert_eq!(store.get(n.id).unwrap().updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn test_terminal_states_are_skipped() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        for status in [NotificationStatus::Failed, NotificationStatus::Cancelled] {
            let mut n = make_notification(vec![Channel::Push]);
            n.status = status;
            seed(&store, &n).await;
            let outcome = service.dispatch(n.id).await.unwrap();
            assert!(outcome.is_skipped());
            assert_eq!(store.get(n.id).unwrap().status, status);
        }
        assert_eq!(push.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_is_cancelled_without_provider_call() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push])
            .with_expires_at(Utc::now() - ChronoDuration::minutes(1));
        seed(&store, &n).await;

        let outcome = service.dispatch(n.id).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Skipped {
                reason: SkipReason::Expired,
                ..
            }
        ));
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Cancelled);
        assert_eq!(push.calls(), 0);
        assert!(store.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_in_future_is_not_due() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push])
            .with_scheduled_at(Utc::now() + ChronoDuration::hours(1));
        seed(&store, &n).await;

        let outcome = service.dispatch(n.id).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Skipped {
                reason: SkipReason::NotDue { .. },
                ..
            }
        ));
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Pending);
        assert_eq!(push.calls(), 0);

        let delay = outcome.requeue_delay(Utc::now()).unwrap();
        assert!(delay > Duration::from_secs(3590) && delay <= Duration::from_secs(3600));
        assert_eq!(outcome.retry_backoff(), None);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_pending() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Fail { retryable: true });
        let service = make_service(&store, vec![push]);

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert_eq!(
            report.disposition,
            Disposition::Retry {
                retry_count: 1,
                backoff: Duration::from_secs(30)
            }
        );
        let stored = store.get(n.id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.sent_at.is_none());
        assert_eq!(stored.metadata["last_errors"][0], "push: provider error");
    }

    #[tokio::test]
    async fn test_retry_after_hint_extends_backoff() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(
            Channel::Push,
            Behavior::RateLimited(Duration::from_secs(300)),
        );
        let service = make_service(&store, vec![push]);

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        let outcome = service.dispatch(n.id).await.unwrap();
        assert_eq!(outcome.retry_backoff(), Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Fail { retryable: true });
        let service = make_service(&store, vec![push]);

        let mut n = make_notification(vec![Channel::Push]);
        n.retry_count = n.max_retries;
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert_eq!(
            report.disposition,
            Disposition::Failed {
                reason: "Max retries exceeded".to_string()
            }
        );
        let stored = store.get(n.id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);
        assert_eq!(stored.metadata["failure_reason"], "Max retries exceeded");
        assert!(stored.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_retry_budget_runs_out_over_attempts() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Fail { retryable: true });
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push]).with_max_retries(2);
        seed(&store, &n).await;

        for _ in 0..3 {
            service.dispatch(n.id).await.unwrap();
            let stored = store.get(n.id).unwrap();
            assert!(stored.retry_count <= stored.max_retries);
        }
        let stored = store.get(n.id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(push.calls(), 3);
    }

    #[tokio::test]
    async fn test_fatal_failure_fails_immediately() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let email = ScriptedProvider::new(Channel::Email, Behavior::Fail { retryable: false });
        let service = make_service(&store, vec![email]);

        let n = make_notification(vec![Channel::Email]);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert!(matches!(report.disposition, Disposition::Failed { .. }));
        assert_eq!(store.get(n.id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_invalid_target_deactivated_and_not_retried() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::InvalidTarget);
        let service = make_service(&store, vec![push]);

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert!(matches!(report.disposition, Disposition::Failed { .. }));
        assert!(!store.is_target_active(Channel::Push, "device-token"));
    }

    #[tokio::test]
    async fn test_missing_provider_and_targets_fail_without_attempts() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let service = make_service(&store, vec![]);

        let n = make_notification(vec![Channel::Sms]);
        seed(&store, &n).await;
        let report1 = report(service.dispatch(n.id).await.unwrap());
        assert_eq!(
            report1.failures,
            vec!["sms: channel not configured: no provider registered".to_string()]
        );
        assert!(matches!(report1.disposition, Disposition::Failed { .. }));

        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);
        let n = make_notification(vec![Channel::Push]);
        store.insert(&n).await.unwrap();
        let report2 = report(service.dispatch(n.id).await.unwrap());
        assert_eq!(report2.failures, vec!["push: no active target".to_string()]);

        assert!(store.attempts().is_empty());
        assert_eq!(push.calls(), 0);
    }

    #[tokio::test]
    async fn test_websocket_targets_recipient() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let ws = ScriptedProvider::new(Channel::Websocket, Behavior::Deliver);
        let service = make_service(&store, vec![ws]);

        let n = make_notification(vec![Channel::Websocket]);
        seed(&store, &n).await;
        service.dispatch(n.id).await.unwrap();

        let attempts = store.attempts();
        assert_eq!(attempts[0].target, n.recipient_id.to_string());
    }

    #[tokio::test]
    async fn test_channels_follow_configured_order() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let service = make_service(
            &store,
            vec![
                ScriptedProvider::new(Channel::Push, Behavior::Fail { retryable: true }),
                ScriptedProvider::new(Channel::Email, Behavior::Deliver),
                ScriptedProvider::new(Channel::Websocket, Behavior::Deliver),
            ],
        );

        let n = make_notification(vec![Channel::Websocket, Channel::Email, Channel::Push]);
        seed(&store, &n).await;
        service.dispatch(n.id).await.unwrap();

        let order: Vec<Channel> = store.attempts().iter().map(|a| a.channel).collect();
        assert_eq!(order, vec![Channel::Push, Channel::Email, Channel::Websocket]);
    }

    #[tokio::test]
    async fn test_unknown_id_skipped() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let service = make_service(&store, vec![]);
        let outcome = service.dispatch(Uuid::new_v4()).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Skipped {
                reason: SkipReason::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invariant_violations_raise() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let service = make_service(&store, vec![]);

        let n = make_notification(vec![]);
        store.insert(&n).await.unwrap();
        assert!(matches!(
            service.dispatch(n.id).await,
            Err(DispatchError::InvalidNotification { .. })
        ));

        let mut n = make_notification(vec![Channel::Push]);
        n.retry_count = n.max_retries + 1;
        store.insert(&n).await.unwrap();
        assert!(matches!(
            service.dispatch(n.id).await,
            Err(DispatchError::InvalidNotification { .. })
        ));
    }

    #[tokio::test]
    async fn test_provider_receives_ttl_from_expiry() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push])
            .with_priority(Priority::Low)
            .with_expires_at(Utc::now() + ChronoDuration::seconds(120));
        seed(&store, &n).await;
        service.dispatch(n.id).await.unwrap();

        let metas = push.metas();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].priority, Priority::Low);
        assert_eq!(metas[0].priority.provider_priority(), "normal");
        assert!(metas[0].ttl > Duration::from_secs(115) && metas[0].ttl <= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_provider_receives_priority_default_ttl() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let service = make_service(&store, vec![push.clone()]);

        let n = make_notification(vec![Channel::Push]).with_priority(Priority::Urgent);
        seed(&store, &n).await;
        service.dispatch(n.id).await.unwrap();

        let meta = &push.metas()[0];
        assert_eq!(meta.notification_id, n.id);
        assert_eq!(meta.recipient_id, n.recipient_id);
        assert_eq!(meta.priority.provider_priority(), "high");
        assert_eq!(meta.ttl, Duration::from_secs(3600));
    }

    /// Provider that cancels the notification behind the dispatcher's back.
    struct CancellingProvider {
        store: Arc<InMemoryNotificationStore>,
    }

    #[async_trait::async_trait]
    impl ChannelProvider for CancellingProvider {
        fn channel(&self) -> Channel {
            Channel::Push
        }

        async fn send(&self, _: &str, _: &ChannelPayload, meta: &DeliveryMeta) -> ChannelResult {
            let mut current = self.store.get(meta.notification_id).unwrap();
            current.mark_failed("batch timed out", Utc::now()).unwrap();
            self.store
                .save(&current, NotificationStatus::Pending)
                .await
                .unwrap();
            ChannelResult::delivered(None)
        }
    }

    #[tokio::test]
    async fn test_concurrent_update_wins_over_dispatch_result() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(CancellingProvider {
            store: store.clone(),
        }));
        let service = DispatchService::new(
            store.clone(),
            store.clone(),
            registry,
            DispatchConfig::default(),
        );

        let n = make_notification(vec![Channel::Push]);
        seed(&store, &n).await;

        let outcome = service.dispatch(n.id).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Skipped {
                reason: SkipReason::Superseded,
                ..
            }
        ));
        let stored = store.get(n.id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert!(stored.sent_at.is_none());
        assert_eq!(store.attempts().len(), 1);
    }

    /// Target registry whose lookups fail for one channel.
    struct FlakyTargets {
        inner: Arc<InMemoryNotificationStore>,
        broken: Channel,
    }

    #[async_trait::async_trait]
    impl TargetRegistry for FlakyTargets {
        async fn targets(&self, recipient_id: Uuid, channel: Channel) -> Result<Vec<String>, AppError> {
            if channel == self.broken {
                return Err(AppError::Internal("connection reset".to_string()));
            }
            self.inner.targets(recipient_id, channel).await
        }

        async fn deactivate(&self, channel: Channel, address: &str) -> Result<(), AppError> {
            self.inner.deactivate(channel, address).await
        }
    }

    #[tokio::test]
    async fn test_target_lookup_error_isolated_to_channel() {
        let store = Arc::new(InMemoryNotificationStore::new());
        let push = ScriptedProvider::new(Channel::Push, Behavior::Deliver);
        let email = ScriptedProvider::new(Channel::Email, Behavior::Deliver);
        let mut registry = ProviderRegistry::new();
        registry.register(push.clone());
        registry.register(email.clone());
        let targets = Arc::new(FlakyTargets {
            inner: store.clone(),
            broken: Channel::Push,
        });
        let service = DispatchService::new(store.clone(), targets, registry, DispatchConfig::default());

        let n = make_notification(vec![Channel::Push, Channel::Email]);
        seed(&store, &n).await;

        let report = report(service.dispatch(n.id).await.unwrap());
        assert!(report.success);
        assert!(!report.channels[&Channel::Push]);
        assert!(report.channels[&Channel::Email]);
        assert!(report.failures[0].starts_with("push: target lookup failed"));
        assert_eq!(push.calls(), 0);
        assert_eq!(email.calls(), 1);
        assert_eq!(store.get(n.id).unwrap().status, NotificationStatus::Sent);
    }
}
