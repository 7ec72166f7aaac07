//! Production wiring shared by the API server and the worker.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use notice_common::config::AppConfig;
use notice_engine::NotificationService;
use notice_engine::counter::RedisCounterStore;
use notice_engine::dispatcher::DeliveryChannels;
use notice_engine::registry::{NotifyRegistry, ReceiverRegistry, TableLookup};
use notice_engine::store::PgStore;

use crate::queue::{RedisBroadcaster, RedisJobQueue, RedisMailQueue};

/// Receiver kind backed by the `users` table.
pub const USER_KIND: &str = "User";

/// Every long-lived component built from configuration.
#[derive(Clone)]
pub struct DeliveryRuntime {
    pub store: Arc<PgStore>,
    pub jobs: Arc<RedisJobQueue>,
    pub mail: Arc<RedisMailQueue>,
    pub receivers: Arc<ReceiverRegistry>,
    pub service: NotificationService,
}

impl DeliveryRuntime {
    pub fn build(
        pool: PgPool,
        redis: ConnectionManager,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(PgStore::new(pool.clone()));
        let jobs = Arc::new(RedisJobQueue::new(redis.clone()));
        let mail = Arc::new(RedisMailQueue::new(redis.clone()));
        let channels = DeliveryChannels {
            queue: jobs.clone(),
            mailer: mail.clone(),
            broadcaster: Arc::new(RedisBroadcaster::new(redis.clone())),
        };

        let receivers = Arc::new(ReceiverRegistry::new().register(
            USER_KIND,
            Arc::new(TableLookup::new(pool, USER_KIND, "users")?),
        ));

        let overrides = match &config.notify_registry_path {
            Some(path) => NotifyRegistry::load(path)?,
            None => NotifyRegistry::new(),
        };

        let service = NotificationService::new(
            store.clone(),
            Arc::new(RedisCounterStore::new(redis)),
            channels,
            config.default_send_email,
        )
        .with_receivers(receivers.clone())
        .with_overrides(Arc::new(overrides));

        Ok(Self {
            store,
            jobs,
            mail,
            receivers,
            service,
        })
    }
}
