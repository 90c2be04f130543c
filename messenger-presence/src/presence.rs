use async_trait::async_trait;
use messenger_core::config::PresenceConfig;
use messenger_core::redis::CacheRetry;
use messenger_core::types::{ChatId, Role, UserId};
use messenger_core::MessengerResult;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
    /// The cache could not be consulted.
    Indeterminate,
}

/// TTL-based activity tracking. A user is online while their activity key
/// exists; expiry is the offline transition, nothing ever writes "offline".
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Refreshes the user's activity. Returns true when the user was absent
    /// before this call.
    async fn set_active(&self, user_id: UserId, role: Role) -> MessengerResult<bool>;

    async fn set_active_in_chat(&self, user_id: UserId, role: Role, chat_id: ChatId) -> MessengerResult<()>;

    async fn is_active_in_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<bool>;

    async fn status(&self, user_id: UserId) -> PresenceStatus;

    /// Users active within `window` (clamped to the activity TTL), optionally
    /// restricted to one role.
    async fn get_active_users(&self, role: Option<Role>, window: Option<Duration>) -> MessengerResult<Vec<UserId>>;
}

// KEYS[1] user key, KEYS[2] role set
// ARGV[1] user id, ARGV[2] role, ARGV[3] ttl seconds
const SET_ACTIVE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local ttl = tonumber(ARGV[3])
local existed = redis.call('EXISTS', KEYS[1])
redis.call('SET', KEYS[1], ARGV[2], 'EX', ttl)
redis.call('ZADD', KEYS[2], now, ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', '(' .. (now - ttl * 1000))
redis.call('EXPIRE', KEYS[2], ttl)
if existed == 0 then return 1 end
return 0
"#;

// KEYS role sets, ARGV[1] window in milliseconds
const ACTIVE_USERS_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local since = now - tonumber(ARGV[1])
local result = {}
for _, key in ipairs(KEYS) do
  for _, member in ipairs(redis.call('ZRANGEBYSCORE', key, since, '+inf')) do
    table.insert(result, member)
  end
end
return result
"#;

pub fn user_key(user_id: UserId) -> String {
    format!("presence:user:{}", user_id)
}

pub fn role_key(role: Role) -> String {
    format!("presence:role:{}", role)
}

pub fn chat_key(chat_id: ChatId, user_id: UserId) -> String {
    format!("presence:chat:{}:{}", chat_id, user_id)
}

pub struct RedisPresence {
    conn: ConnectionManager,
    retry: CacheRetry,
    activity_ttl: Duration,
    chat_activity_ttl: Duration,
    set_active: Script,
    active_users: Script,
}

impl RedisPresence {
    pub fn new(conn: ConnectionManager, retry: CacheRetry, config: &PresenceConfig) -> Self {
        RedisPresence {
            conn,
            retry,
            activity_ttl: config.activity_ttl(),
            chat_activity_ttl: config.chat_activity_ttl(),
            set_active: Script::new(SET_ACTIVE_SCRIPT),
            active_users: Script::new(ACTIVE_USERS_SCRIPT),
        }
    }
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set_active(&self, user_id: UserId, role: Role) -> MessengerResult<bool> {
        let user = user_key(user_id);
        let role_set = role_key(role);
        let ttl = self.activity_ttl.as_secs().max(1);

        let became_active: i64 = self
            .retry
            .run("presence.set_active", || {
                let mut conn = self.conn.clone();
                let mut invocation = self.set_active.prepare_invoke();
                invocation
                    .key(&user)
                    .key(&role_set)
                    .arg(user_id)
                    .arg(role.as_str())
                    .arg(ttl);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        if became_active == 1 {
            tracing::debug!(user_id, role = %role, "User became active");
        }
        Ok(became_active == 1)
    }

    async fn set_active_in_chat(&self, user_id: UserId, role: Role, chat_id: ChatId) -> MessengerResult<()> {
        let key = chat_key(chat_id, user_id);
        let ttl = self.chat_activity_ttl.as_secs().max(1);
        self.retry
            .run("presence.set_active_in_chat", || {
                let mut conn = self.conn.clone();
                let key = key.as_str();
                async move {
                    let _: () = redis::cmd("SET")
                        .arg(key)
                        .arg(role.as_str())
                        .arg("EX")
                        .arg(ttl)
                        .query_async(&mut conn)
                        .await?;
                    Ok(())
                }
            })
            .await
    }

    async fn is_active_in_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<bool> {
        let key = chat_key(chat_id, user_id);
        self.retry
            .run("presence.is_active_in_chat", || {
                let mut conn = self.conn.clone();
                let key = key.as_str();
                async move {
                    let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
                    Ok(exists)
                }
            })
            .await
    }

    async fn status(&self, user_id: UserId) -> PresenceStatus {
        let key = user_key(user_id);
        let result = self
            .retry
            .run("presence.status", || {
                let mut conn = self.conn.clone();
                let key = key.as_str();
                async move {
                    let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
                    Ok(exists)
                }
            })
            .await;

        match result {
            Ok(true) => PresenceStatus::Online,
            Ok(false) => PresenceStatus::Offline,
            Err(e) => {
                tracing::warn!(user_id, "Presence is indeterminate: {}", e);
                PresenceStatus::Indeterminate
            }
        }
    }

    async fn get_active_users(&self, role: Option<Role>, window: Option<Duration>) -> MessengerResult<Vec<UserId>> {
        let window_ms = clamp_window(window, self.activity_ttl).as_millis() as u64;
        let keys: Vec<String> = match role {
            Some(role) => vec![role_key(role)],
            None => Role::ALL.iter().map(|r| role_key(*r)).collect(),
        };

        let mut users: Vec<UserId> = self
            .retry
            .run("presence.get_active_users", || {
                let mut conn = self.conn.clone();
                let mut invocation = self.active_users.prepare_invoke();
                for key in &keys {
                    invocation.key(key);
                }
                invocation.arg(window_ms);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        users.sort_unstable();
        users.dedup();
        Ok(users)
    }
}

/// Never look further back than the TTL, or expired users would be reported.
pub fn clamp_window(window: Option<Duration>, ttl: Duration) -> Duration {
    window.map_or(ttl, |w| w.min(ttl))
}
