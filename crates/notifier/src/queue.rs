//! Redis job queue.
//!
//! Three lists, popped with `BRPOP` in priority order, plus a sorted set of
//! delayed retries scored by their due time (unix seconds). Due retries are
//! moved to the default lane by [`JobQueue::promote_due`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::Priority;

pub const URGENT_LANE: &str = "notifications:urgent";
pub const DEFAULT_LANE: &str = "notifications:default";
pub const BATCH_LANE: &str = "notifications:batch";
pub const RETRY_SET: &str = "notifications:retry";

/// Upper bound on retries promoted in one pass.
const PROMOTE_LIMIT: isize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    Dispatch { id: Uuid },
    Batch { ids: Vec<Uuid> },
}

impl Job {
    pub fn encode(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, AppError> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn lane_for(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent | Priority::High => URGENT_LANE,
        Priority::Medium | Priority::Low => DEFAULT_LANE,
    }
}

/// Score of a retry entry: unix seconds at which it becomes due.
pub fn retry_score(now: DateTime<Utc>, backoff: Duration) -> i64 {
    now.timestamp() + i64::try_from(backoff.as_secs()).unwrap_or(i64::MAX / 2)
}

#[derive(Clone)]
pub struct JobQueue {
    redis: ConnectionManager,
    /// `BRPOP` holds its connection for the whole wait, so consumers get
    /// their own.
    blocking: ConnectionManager,
}

impl JobQueue {
    pub fn new(redis: ConnectionManager, blocking: ConnectionManager) -> Self {
        Self { redis, blocking }
    }

    async fn push(&self, lane: &str, job: &Job) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(lane)
            .arg(job.encode()?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn enqueue_dispatch(&self, id: Uuid, priority: Priority) -> Result<(), AppError> {
        let lane = lane_for(priority);
        self.push(lane, &Job::Dispatch { id }).await?;
        tracing::debug!(notification_id = %id, lane, "Dispatch job enqueued");
        Ok(())
    }

    pub async fn enqueue_batch(&self, ids: Vec<Uuid>) -> Result<(), AppError> {
        let batch_size = ids.len();
        self.push(BATCH_LANE, &Job::Batch { ids }).await?;
        tracing::debug!(batch_size, "Batch job enqueued");
        Ok(())
    }

    /// Wait up to `timeout_secs` for the next job. Undecodable payloads are
    /// dropped with an error log.
    pub async fn pop(&self, timeout_secs: f64) -> Result<Option<Job>, AppError> {
        let mut conn = self.blocking.clone();
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(URGENT_LANE)
            .arg(DEFAULT_LANE)
            .arg(BATCH_LANE)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some((lane, raw)) = popped else {
            return Ok(None);
        };

        match Job::decode(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::error!(lane = %lane, error = %e, payload = %raw, "Dropping malformed job");
                Ok(None)
            }
        }
    }

    /// Schedule another dispatch of `id` after `backoff`. Rescheduling an id
    /// already in the set moves its due time.
    pub async fn schedule_retry(&self, id: Uuid, backoff: Duration) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let score = retry_score(Utc::now(), backoff);
        let _: i64 = redis::cmd("ZADD")
            .arg(RETRY_SET)
            .arg(score)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;

        tracing::info!(notification_id = %id, backoff_secs = backoff.as_secs(), "Retry scheduled");
        Ok(())
    }

    /// Move due retries onto the default lane. An entry is pushed only by the
    /// caller whose `ZREM` removed it, so concurrent workers never double-enqueue.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_SET)
            .arg("-inf")
            .arg(now.timestamp())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_LIMIT)
            .query_async(&mut conn)
            .await?;

        let mut promoted = 0;
        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(RETRY_SET)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }

            match member.parse::<Uuid>() {
                Ok(id) => {
                    self.push(DEFAULT_LANE, &Job::Dispatch { id }).await?;
                    promoted += 1;
                }
                Err(_) => tracing::warn!(member = %member, "Discarding malformed retry entry"),
            }
        }

        if promoted > 0 {
            tracing::debug!(promoted, "Promoted due retries");
        }
        Ok(promoted)
    }
}
