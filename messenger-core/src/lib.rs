pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod protocol;
pub mod redis;
pub mod redpanda;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::Config;
pub use context::MessengerContext;
pub use db::DbPool;
pub use error::{MessengerError, MessengerResult};
pub use crate::redis::{CacheRetry, RedisPool};
pub use redpanda::{RedpandaConsumer, RedpandaProducer};
pub use storage::Storage;
