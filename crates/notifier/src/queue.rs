//! Redis-backed delivery queues and socket broadcaster.
//!
//! Both queues are sorted sets scored by fire time in milliseconds since the
//! epoch. Workers claim due members with a Lua script that reads and removes
//! them in one step, so a member is handed to at most one worker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use notice_common::error::AppError;
use notice_common::types::{DbId, SocketPayload};
use notice_engine::delivery::{
    JobQueue, MailRequest, Mailer, MemoryJobQueue, MemoryMailer, SocketBroadcaster,
};

/// Sorted set holding pending delivery jobs.
pub const JOB_QUEUE_KEY: &str = "notice:queue:jobs";

/// Sorted set holding pending emails.
pub const MAIL_QUEUE_KEY: &str = "notice:queue:mail";

/// Pop up to ARGV[2] members scored at or below ARGV[1].
const CLAIM_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
end
return due
"#;

/// Score for a member firing at `fire_at`, or immediately.
fn score(fire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    fire_at.unwrap_or(now).timestamp_millis()
}

/// A sorted-set delay queue of string members.
#[derive(Clone)]
pub struct RedisDelayQueue {
    redis: ConnectionManager,
    key: String,
    claim: redis::Script,
}

impl RedisDelayQueue {
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
            claim: redis::Script::new(CLAIM_DUE),
        }
    }

    pub async fn push(&self, member: &str, fire_at: Option<DateTime<Utc>>) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis
            .zadd::<_, _, _, ()>(&self.key, member, score(fire_at, Utc::now()))
            .await?;
        Ok(())
    }

    /// Remove and return up to `limit` members due at `now`, earliest first.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>, AppError> {
        let mut redis = self.redis.clone();
        let members: Vec<String> = self
            .claim
            .key(&self.key)
            .arg(now.timestamp_millis())
            .arg(limit)
            .invoke_async(&mut redis)
            .await?;
        Ok(members)
    }
}

/// Source of due delivery jobs.
#[async_trait]
pub trait DueJobs: Send + Sync {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DbId>, AppError>;
}

/// Source of due emails.
#[async_trait]
pub trait DueMail: Send + Sync {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<MailRequest>, AppError>;
}

/// Delivery job queue keyed by notification id.
#[derive(Clone)]
pub struct RedisJobQueue {
    queue: RedisDelayQueue,
}

impl RedisJobQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            queue: RedisDelayQueue::new(redis, JOB_QUEUE_KEY),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        notification_id: DbId,
        fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        self.queue.push(&notification_id.to_string(), fire_at).await
    }
}

#[async_trait]
impl DueJobs for RedisJobQueue {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DbId>, AppError> {
        let members = self.queue.claim_due(now, limit).await?;
        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(member = %member, "Dropping malformed job queue member");
                    None
                }
            })
            .collect())
    }
}

/// Mail queue holding serialized [`MailRequest`]s.
#[derive(Clone)]
pub struct RedisMailQueue {
    queue: RedisDelayQueue,
}

impl RedisMailQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            queue: RedisDelayQueue::new(redis, MAIL_QUEUE_KEY),
        }
    }
}

#[async_trait]
impl Mailer for RedisMailQueue {
    async fn send(&self, request: MailRequest) -> Result<(), AppError> {
        let member = serde_json::to_string(&request)
            .map_err(|e| AppError::Queue(format!("Failed to encode mail request: {}", e)))?;
        self.queue.push(&member, request.fire_at).await
    }
}

#[async_trait]
impl DueMail for RedisMailQueue {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MailRequest>, AppError> {
        let members = self.queue.claim_due(now, limit).await?;
        Ok(members
            .into_iter()
            .filter_map(|member| match serde_json::from_str(&member) {
                Ok(request) => Some(request),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed mail queue member");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl DueJobs for MemoryJobQueue {
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DbId>, AppError> {
        let mut due = self.jobs.take_due(now).await;
        for id in due.split_off(limit.min(due.len())) {
            self.jobs.push(id, None).await;
        }
        Ok(due)
    }
}

#[async_trait]
impl DueMail for MemoryMailer {
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MailRequest>, AppError> {
        let mut due = self.outbox.take_due(now).await;
        for request in due.split_off(limit.min(due.len())) {
            let fire_at = request.fire_at;
            self.outbox.push(request, fire_at).await;
        }
        Ok(due)
    }
}

/// Publishes socket payloads on Redis channels for the socket server.
#[derive(Clone)]
pub struct RedisBroadcaster {
    redis: ConnectionManager,
}

impl RedisBroadcaster {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl SocketBroadcaster for RedisBroadcaster {
    async fn publish(&self, channel: &str, payload: &SocketPayload) -> Result<usize, AppError> {
        let message = serde_json::to_string(payload)
            .map_err(|e| AppError::Internal(format!("Failed to encode socket payload: {}", e)))?;
        let mut redis = self.redis.clone();
        let listeners: usize = redis.publish(channel, message).await?;
        Ok(listeners)
    }
}
