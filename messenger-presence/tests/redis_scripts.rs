//! Runs the Lua scripts against a real server. Start Redis and set
//! `REDIS_URL`, then `cargo test -p messenger-presence -- --ignored`.

use messenger_bus::LocalBusHub;
use messenger_core::config::{CountersConfig, PresenceConfig};
use messenger_core::redis::CacheRetry;
use messenger_core::types::{ChatType, Role, UserId};
use messenger_presence::counters::total_counter_key;
use messenger_presence::{
    CounterSnapshot, PresenceStatus, PresenceStore, RedisPresence, RedisReplayGuard, RedisUnreadCounters,
    ReplayGuard, UnreadCounterStore,
};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

async fn connect() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL required");
    redis::Client::open(url)
        .expect("valid Redis URL")
        .get_connection_manager()
        .await
        .expect("Redis reachable")
}

/// Keeps runs against a shared server from seeing each other's keys.
fn fresh_user() -> UserId {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    (nanos % 1_000_000_000_000) as UserId
}

async fn counters(conn: ConnectionManager) -> RedisUnreadCounters {
    let (bus, _rx) = LocalBusHub::new().attach(Uuid::new_v4()).await;
    RedisUnreadCounters::new(conn, CacheRetry::default(), Arc::new(bus), &CountersConfig::default())
}

#[tokio::test]
#[ignore] // Requires Redis
async fn activity_key_expires_after_ttl() {
    let config = PresenceConfig {
        activity_ttl_secs: 1,
        chat_activity_ttl_secs: 1,
    };
    let presence = RedisPresence::new(connect().await, CacheRetry::default(), &config);
    let user = fresh_user();

    assert!(presence.set_active(user, Role::Scout).await.unwrap());
    assert!(!presence.set_active(user, Role::Scout).await.unwrap());
    assert_eq!(presence.status(user).await, PresenceStatus::Online);
    let active = presence.get_active_users(Some(Role::Scout), None).await.unwrap();
    assert!(active.contains(&user));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(presence.status(user).await, PresenceStatus::Offline);
    let active = presence.get_active_users(Some(Role::Scout), None).await.unwrap();
    assert!(!active.contains(&user));

    // Back after expiry is a fresh online transition.
    assert!(presence.set_active(user, Role::Scout).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn counters_move_together_and_reset_once() {
    let counters = counters(connect().await).await;
    let user = fresh_user();

    counters.increment(user, 1, ChatType::Personal).await.unwrap();
    let snapshot = counters.increment(user, 1, ChatType::Personal).await.unwrap();
    assert_eq!(snapshot, CounterSnapshot { by_chat: 2, by_chat_type: 2, total: 2 });
    counters.increment(user, 2, ChatType::Ticket).await.unwrap();

    let snapshot = counters.reset(user, 1, ChatType::Personal).await.unwrap();
    assert_eq!(snapshot, CounterSnapshot { by_chat: 0, by_chat_type: 0, total: 1 });
    let again = counters.reset(user, 1, ChatType::Personal).await.unwrap();
    assert_eq!(again, snapshot);

    let all = counters.get(user).await.unwrap();
    assert_eq!(all.total, 1);
    assert_eq!(all.by_chat_type.get(&ChatType::Ticket), Some(&1));
    assert_eq!(counters.get_by_chat(user, 2).await.unwrap(), 1);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn reset_never_drives_scopes_negative() {
    let mut conn = connect().await;
    let counters = counters(conn.clone()).await;
    let user = fresh_user();

    counters.increment(user, 1, ChatType::Match).await.unwrap();
    counters.increment(user, 1, ChatType::Match).await.unwrap();
    counters.increment(user, 3, ChatType::Match).await.unwrap();

    // Total expired ahead of the chat scope.
    let _: i64 = redis::cmd("DEL")
        .arg(total_counter_key(user))
        .query_async(&mut conn)
        .await
        .unwrap();

    let snapshot = counters.reset(user, 1, ChatType::Match).await.unwrap();
    assert_eq!(snapshot, CounterSnapshot { by_chat: 0, by_chat_type: 1, total: 0 });
    assert_eq!(counters.get(user).await.unwrap().total, 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn replay_key_is_single_use_until_forgotten() {
    let guard = RedisReplayGuard::new(connect().await, CacheRetry::default(), Duration::from_secs(60));
    let key = format!("receipt:{}:1:read", fresh_user());

    assert!(guard.first_seen(&key).await.unwrap());
    assert!(!guard.first_seen(&key).await.unwrap());
    guard.forget(&key).await.unwrap();
    assert!(guard.first_seen(&key).await.unwrap());
    guard.forget(&key).await.unwrap();
}
