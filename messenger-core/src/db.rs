use anyhow::{anyhow, Context, Result};
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing;

use crate::config::{mask_url_password, DatabaseConfig};

pub type DbPool = Pool<AsyncPgConnection>;
pub type DbConnection = Object<AsyncPgConnection>;

const CONNECT_ATTEMPTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Builds the pool and waits until one connection can be checked out, so a
/// database that is still starting does not fail the process outright.
pub async fn create_pool(config: &DatabaseConfig) -> Result<Arc<DbPool>> {
    tracing::info!("Connecting to database {}", mask_url_password(&config.url));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
    let pool = Pool::builder(manager)
        .max_size(config.max_connections as usize)
        .build()
        .context("Failed to build database pool")?;

    // 1s, 2s, 4s, 8s between attempts
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(500)
        .take(CONNECT_ATTEMPTS - 1);

    Retry::spawn(strategy, || async {
        match tokio::time::timeout(CONNECT_TIMEOUT, pool.get()).await {
            Ok(Ok(_conn)) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("Database not reachable yet: {}", e);
                Err(anyhow!("database connection failed: {}", e))
            }
            Err(_) => {
                tracing::warn!("Database connection timed out after {:?}", CONNECT_TIMEOUT);
                Err(anyhow!("database connection timed out"))
            }
        }
    })
    .await
    .context("Giving up on the database")?;

    tracing::info!("Database pool ready ({} connections max)", config.max_connections);
    Ok(Arc::new(pool))
}
