use async_trait::async_trait;
use messenger_core::redis::CacheRetry;
use messenger_core::types::{MessageId, UserId};
use messenger_core::MessengerResult;
use redis::aio::ConnectionManager;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptKind {
    Read,
    Received,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Read => "read",
            ReceiptKind::Received => "received",
        }
    }
}

pub fn receipt_key(user_id: UserId, message_id: MessageId, kind: ReceiptKind) -> String {
    format!("receipt:{}:{}:{}", user_id, message_id, kind.as_str())
}

/// Remembers which receipts were already applied so that client retries do
/// not mutate counters twice.
#[async_trait]
pub trait ReplayGuard: Send + Sync {
    /// True the first time `key` is seen within the guard's window.
    async fn first_seen(&self, key: &str) -> MessengerResult<bool>;

    /// Drops `key` so the next receipt with it counts as first again.
    async fn forget(&self, key: &str) -> MessengerResult<()>;
}

pub struct RedisReplayGuard {
    conn: ConnectionManager,
    retry: CacheRetry,
    window: Duration,
}

impl RedisReplayGuard {
    pub fn new(conn: ConnectionManager, retry: CacheRetry, window: Duration) -> Self {
        RedisReplayGuard { conn, retry, window }
    }
}

#[async_trait]
impl ReplayGuard for RedisReplayGuard {
    async fn first_seen(&self, key: &str) -> MessengerResult<bool> {
        let ttl = self.window.as_secs().max(1);
        let stored: Option<String> = self
            .retry
            .run("replay.first_seen", || {
                let mut conn = self.conn.clone();
                async move {
                    let stored: Option<String> = redis::cmd("SET")
                        .arg(key)
                        .arg(1)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl)
                        .query_async(&mut conn)
                        .await?;
                    Ok(stored)
                }
            })
            .await?;
        Ok(stored.is_some())
    }

    async fn forget(&self, key: &str) -> MessengerResult<()> {
        self.retry
            .run("replay.forget", || {
                let mut conn = self.conn.clone();
                async move {
                    let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
                    Ok(())
                }
            })
            .await
    }
}
