use async_trait::async_trait;
use messenger_bus::{BusEnvelope, Channel, EventBus};
use messenger_core::config::CountersConfig;
use messenger_core::protocol::ServerEvent;
use messenger_core::redis::CacheRetry;
use messenger_core::types::{ChatId, ChatType, UnreadCounters, UserId};
use messenger_core::MessengerResult;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing;

/// Values of the three counter scopes right after a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub by_chat: i64,
    pub by_chat_type: i64,
    pub total: i64,
}

#[async_trait]
pub trait UnreadCounterStore: Send + Sync {
    /// Adds one unread message to the chat, chat-type and total scopes.
    async fn increment(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot>;

    /// Zeroes the chat scope and takes the removed amount off the other two.
    async fn reset(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot>;

    async fn get(&self, user_id: UserId) -> MessengerResult<UnreadCounters>;

    async fn get_by_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<i64>;
}

// KEYS[1] by chat, KEYS[2] by chat type, KEYS[3] total; ARGV[1] ttl seconds
const INCREMENT_SCRIPT: &str = r#"
local values = {}
for i, key in ipairs(KEYS) do
  values[i] = redis.call('INCRBY', key, 1)
  redis.call('EXPIRE', key, ARGV[1])
end
return values
"#;

// Same keys. Scopes never go below zero even if a key expired early.
const RESET_SCRIPT: &str = r#"
local removed = tonumber(redis.call('GET', KEYS[1]) or '0')
redis.call('DEL', KEYS[1])
local values = {0}
for i = 2, 3 do
  local current = tonumber(redis.call('GET', KEYS[i]) or '0')
  local remaining = current - removed
  if remaining < 0 then remaining = 0 end
  if remaining == 0 then
    redis.call('DEL', KEYS[i])
  else
    redis.call('SET', KEYS[i], remaining, 'EX', ARGV[1])
  end
  values[i] = remaining
end
values[4] = removed
return values
"#;

pub fn chat_counter_key(user_id: UserId, chat_id: ChatId) -> String {
    format!("unread:{}:chat:{}", user_id, chat_id)
}

pub fn chat_type_counter_key(user_id: UserId, chat_type: ChatType) -> String {
    format!("unread:{}:type:{}", user_id, chat_type)
}

pub fn total_counter_key(user_id: UserId) -> String {
    format!("unread:{}:total", user_id)
}

pub struct RedisUnreadCounters {
    conn: ConnectionManager,
    retry: CacheRetry,
    bus: Arc<dyn EventBus>,
    ttl_secs: u64,
    increment: Script,
    reset: Script,
}

impl RedisUnreadCounters {
    pub fn new(conn: ConnectionManager, retry: CacheRetry, bus: Arc<dyn EventBus>, config: &CountersConfig) -> Self {
        RedisUnreadCounters {
            conn,
            retry,
            bus,
            ttl_secs: config.ttl_secs.max(1),
            increment: Script::new(INCREMENT_SCRIPT),
            reset: Script::new(RESET_SCRIPT),
        }
    }

    fn invoke<'a>(&'a self, script: &'a Script, keys: &[String; 3]) -> impl Future<Output = RedisResult<Vec<i64>>> + 'a {
        let mut conn = self.conn.clone();
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(self.ttl_secs);
        async move { invocation.invoke_async(&mut conn).await }
    }
}

fn counter_keys(user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> [String; 3] {
    [
        chat_counter_key(user_id, chat_id),
        chat_type_counter_key(user_id, chat_type),
        total_counter_key(user_id),
    ]
}

fn snapshot(values: &[i64]) -> CounterSnapshot {
    CounterSnapshot {
        by_chat: values.first().copied().unwrap_or(0).max(0),
        by_chat_type: values.get(1).copied().unwrap_or(0).max(0),
        total: values.get(2).copied().unwrap_or(0).max(0),
    }
}

/// Tells every connection of the user that its counters moved.
pub async fn publish_counters_changed(
    bus: &dyn EventBus,
    user_id: UserId,
    chat_id: ChatId,
    chat_type: ChatType,
    snapshot: CounterSnapshot,
) {
    let envelope = BusEnvelope::new(
        Channel::User(user_id),
        ServerEvent::UnreadCountersChanged {
            chat_id,
            chat_type,
            by_chat: snapshot.by_chat,
            by_chat_type: snapshot.by_chat_type,
            total: snapshot.total,
        },
    );
    if let Err(e) = bus.publish(&envelope).await {
        tracing::warn!(user_id, "Failed to publish counters change: {}", e);
    }
}

#[async_trait]
impl UnreadCounterStore for RedisUnreadCounters {
    async fn increment(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot> {
        let keys = counter_keys(user_id, chat_id, chat_type);
        // INCRBY is not idempotent; a dropped reply may already have counted.
        let values = self
            .retry
            .run_unsent("unread.increment", || self.invoke(&self.increment, &keys))
            .await?;
        let snapshot = snapshot(&values);

        publish_counters_changed(self.bus.as_ref(), user_id, chat_id, chat_type, snapshot).await;
        Ok(snapshot)
    }

    async fn reset(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot> {
        let keys = counter_keys(user_id, chat_id, chat_type);
        let values = self
            .retry
            .run("unread.reset", || self.invoke(&self.reset, &keys))
            .await?;
        let snapshot = snapshot(&values);
        let removed = values.get(3).copied().unwrap_or(0);

        if removed > 0 {
            publish_counters_changed(self.bus.as_ref(), user_id, chat_id, chat_type, snapshot).await;
        }
        Ok(snapshot)
    }

    async fn get(&self, user_id: UserId) -> MessengerResult<UnreadCounters> {
        let mut keys = vec![total_counter_key(user_id)];
        keys.extend(ChatType::ALL.iter().map(|t| chat_type_counter_key(user_id, *t)));

        let values: Vec<Option<i64>> = self
            .retry
            .run("unread.get", || {
                let mut conn = self.conn.clone();
                let keys = &keys;
                async move {
                    let values: Vec<Option<i64>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
                    Ok(values)
                }
            })
            .await?;

        let mut by_chat_type = HashMap::new();
        for (chat_type, value) in ChatType::ALL.iter().zip(values.iter().skip(1)) {
            by_chat_type.insert(*chat_type, value.unwrap_or(0).max(0));
        }
        Ok(UnreadCounters {
            total: values.first().copied().flatten().unwrap_or(0).max(0),
            by_chat_type,
        })
    }

    async fn get_by_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<i64> {
        let key = chat_counter_key(user_id, chat_id);
        let value: Option<i64> = self
            .retry
            .run("unread.get_by_chat", || {
                let mut conn = self.conn.clone();
                let key = key.as_str();
                async move {
                    let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
                    Ok(value)
                }
            })
            .await?;
        Ok(value.unwrap_or(0).max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_clamps_negative_values() {
        let snap = snapshot(&[-1, 4, 7]);
        assert_eq!(snap, CounterSnapshot { by_chat: 0, by_chat_type: 4, total: 7 });
        assert_eq!(snapshot(&[]), CounterSnapshot::default());
    }

    #[test]
    fn counter_keys_cover_three_scopes() {
        let keys = counter_keys(3, 11, ChatType::Ticket);
        assert_eq!(keys[0], "unread:3:chat:11");
        assert_eq!(keys[1], "unread:3:type:ticket");
        assert_eq!(keys[2], "unread:3:total");
    }
}
