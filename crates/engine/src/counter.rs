//! Cached unread counters keyed per receiver and bucket.
//!
//! The cached value is a projection of the unread notification rows, never the
//! source of truth. Every mutation is a single atomic primitive on the backing
//! store; callers never read, modify and write back.
//!
//! Keys follow `"{receiver_type}_{receiver_id}_unread"` for the total and
//! `"{receiver_type}_{receiver_id}_{bucket}_unread"` for category buckets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use notice_common::error::AppError;
use notice_common::types::{BUCKET_TOTAL, EntityRef};

/// Decrements only while the stored value is positive, so concurrent
/// decrements can never push a counter below zero.
const DECREMENT_FLOORED: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;

/// Cache key of one counter bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// The receiver's total unread counter.
    pub fn total(receiver: &EntityRef) -> Self {
        Self(format!("{}_{}_unread", receiver.kind, receiver.id))
    }

    /// A category bucket; the `total` bucket maps onto [`CounterKey::total`].
    pub fn bucket(receiver: &EntityRef, bucket: &str) -> Self {
        if bucket == BUCKET_TOTAL {
            return Self::total(receiver);
        }
        Self(format!("{}_{}_{}_unread", receiver.kind, receiver.id, bucket))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Atomic counter primitives.
///
/// Unavailability surfaces as an error; a missing key reads as zero.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add one, creating the bucket at 1 if absent. Returns the new value.
    async fn increment(&self, key: &CounterKey) -> Result<i64, AppError>;

    /// Subtract one, flooring at zero. Returns the new value.
    async fn decrement(&self, key: &CounterKey) -> Result<i64, AppError>;

    /// Replace the cached value with an authoritative recount.
    async fn overwrite(&self, key: &CounterKey, value: i64) -> Result<(), AppError>;

    async fn read(&self, key: &CounterKey) -> Result<i64, AppError>;
}

/// Redis-backed counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    redis: ConnectionManager,
    decrement: redis::Script,
}

impl RedisCounterStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            decrement: redis::Script::new(DECREMENT_FLOORED),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &CounterKey) -> Result<i64, AppError> {
        let mut redis = self.redis.clone();
        let value: i64 = redis.incr(key.as_str(), 1).await?;
        Ok(value)
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, AppError> {
        let mut redis = self.redis.clone();
        let value: i64 = self
            .decrement
            .key(key.as_str())
            .invoke_async(&mut redis)
            .await?;
        Ok(value)
    }

    async fn overwrite(&self, key: &CounterKey, value: i64) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.set::<_, _, ()>(key.as_str(), value.max(0)).await?;
        Ok(())
    }

    async fn read(&self, key: &CounterKey) -> Result<i64, AppError> {
        let mut redis = self.redis.clone();
        let value: Option<i64> = redis.get(key.as_str()).await?;
        Ok(value.unwrap_or(0))
    }
}

/// In-process counter store.
///
/// Can be switched into an unavailable state to exercise the lifecycle's
/// tolerance of counter failures.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: Mutex<HashMap<CounterKey, i64>>,
    unavailable: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "counter store unavailable",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &CounterKey) -> Result<i64, AppError> {
        self.check_available()?;
        let mut counters = self.counters.lock().await;
        let value = counters.entry(key.clone()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn decrement(&self, key: &CounterKey) -> Result<i64, AppError> {
        self.check_available()?;
        let mut counters = self.counters.lock().await;
        match counters.get_mut(key) {
            Some(value) if *value > 0 => {
                *value -= 1;
                Ok(*value)
            }
            _ => Ok(0),
        }
    }

    async fn overwrite(&self, key: &CounterKey, value: i64) -> Result<(), AppError> {
        self.check_available()?;
        self.counters.lock().await.insert(key.clone(), value.max(0));
        Ok(())
    }

    async fn read(&self, key: &CounterKey) -> Result<i64, AppError> {
        self.check_available()?;
        Ok(self.counters.lock().await.get(key).copied().unwrap_or(0))
    }
}
