use redis::aio::ConnectionManager;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{create_pool as create_db_pool, DbPool};
use crate::redis::{create_connection_manager, create_pool as create_redis_pool, CacheRetry, RedisPool};
use crate::redpanda::{create_consumer, create_producer, RedpandaConsumer, RedpandaProducer};

/// Shared clients owned by the process bootstrap and handed to every
/// component that needs them.
#[derive(Clone)]
pub struct MessengerContext {
    pub config: Arc<Config>,
    pub process_id: Uuid,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
    pub redis: ConnectionManager,
    pub redpanda_producer: RedpandaProducer,
}

impl MessengerContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;
        let redis = create_connection_manager(&redis_pool).await?;
        let redpanda_producer = create_producer(&config.redpanda)?;

        Ok(MessengerContext {
            config: Arc::new(config),
            process_id: Uuid::new_v4(),
            db_pool,
            redis_pool,
            redis,
            redpanda_producer,
        })
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<RedpandaConsumer> {
        create_consumer(&self.config.redpanda, group_id)
    }

    pub fn cache_retry(&self) -> CacheRetry {
        CacheRetry::new(&self.config.cache)
    }
}
