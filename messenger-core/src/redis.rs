use anyhow::{anyhow, Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use std::future::Future;
use std::sync::Arc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing;

use crate::config::{mask_url_password, CacheConfig, RedisConfig};
use crate::error::{MessengerError, MessengerResult};

pub type RedisPool = Arc<Client>;

/// Opens the client and checks the server answers before anything else
/// is wired to it.
pub async fn create_pool(config: &RedisConfig) -> Result<RedisPool> {
    let masked = mask_url_password(&config.url);
    tracing::info!("Connecting to Redis at {}", masked);

    let client = Client::open(config.url.as_str()).with_context(|| format!("Invalid Redis URL {}", masked))?;
    let mut probe = client
        .get_multiplexed_async_connection()
        .await
        .with_context(|| format!("Redis at {} is unreachable", masked))?;
    let pong: String = redis::cmd("PING").query_async(&mut probe).await?;
    tracing::info!("Redis answered {}", pong);

    Ok(Arc::new(client))
}

/// Long-lived, auto-reconnecting handle shared by the presence, counter and
/// bus publishers.
pub async fn create_connection_manager(pool: &RedisPool) -> Result<ConnectionManager> {
    ConnectionManager::new(pool.as_ref().clone())
        .await
        .map_err(|e| anyhow!("Failed to create Redis connection manager: {}", e))
}

pub async fn ping(conn: &mut ConnectionManager) -> MessengerResult<()> {
    let _: String = redis::cmd("PING").query_async(conn).await?;
    Ok(())
}

/// Retry policy for cache calls that fail because Redis is unreachable.
#[derive(Debug, Clone)]
pub struct CacheRetry {
    attempts: usize,
    base_delay_ms: u64,
}

impl CacheRetry {
    pub fn new(config: &CacheConfig) -> Self {
        CacheRetry {
            attempts: config.retry_attempts,
            base_delay_ms: config.retry_base_ms.max(1),
        }
    }

    /// Runs `op`, retrying connection-level failures with jittered
    /// exponential backoff. Logical errors (wrong type, script error) are
    /// returned on the first attempt.
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> MessengerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        self.run_if(op_name, op, is_transient).await
    }

    /// For writes that must not be applied twice: only failures where the
    /// command cannot have reached the server are retried.
    pub async fn run_unsent<T, F, Fut>(&self, op_name: &str, op: F) -> MessengerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        self.run_if(op_name, op, |e: &RedisError| e.is_connection_refusal()).await
    }

    async fn run_if<T, F, Fut, C>(&self, op_name: &str, mut op: F, retryable: C) -> MessengerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
        C: FnMut(&RedisError) -> bool,
    {
        let strategy = ExponentialBackoff::from_millis(self.base_delay_ms)
            .max_delay(std::time::Duration::from_secs(2))
            .take(self.attempts)
            .map(jitter);

        RetryIf::spawn(strategy, || op(), retryable)
            .await
            .map_err(|e| {
                tracing::warn!("Redis operation {} failed: {}", op_name, e);
                MessengerError::CacheUnavailable(format!("{}: {}", op_name, e))
            })
    }
}

impl Default for CacheRetry {
    fn default() -> Self {
        CacheRetry::new(&CacheConfig::default())
    }
}

fn is_transient(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}
