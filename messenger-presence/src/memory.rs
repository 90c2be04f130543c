//! In-process presence, counter and replay stores with the same semantics as
//! the Redis scripts. Time is `tokio::time::Instant`, so tests can pause and
//! advance the clock.

use async_trait::async_trait;
use messenger_bus::EventBus;
use messenger_core::types::{ChatId, ChatType, Role, UnreadCounters, UserId};
use messenger_core::{MessengerError, MessengerResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::counters::{
    chat_counter_key, chat_type_counter_key, publish_counters_changed, total_counter_key, CounterSnapshot,
    UnreadCounterStore,
};
use crate::presence::{clamp_window, PresenceStatus, PresenceStore};
use crate::replay::ReplayGuard;

fn unavailable() -> MessengerError {
    MessengerError::CacheUnavailable("cache marked unavailable".to_string())
}

#[derive(Default)]
struct PresenceState {
    users: HashMap<UserId, (Role, Instant)>,
    chats: HashMap<(ChatId, UserId), Instant>,
    unavailable: bool,
}

pub struct MemoryPresence {
    ttl: Duration,
    chat_ttl: Duration,
    state: Mutex<PresenceState>,
}

impl MemoryPresence {
    pub fn new(ttl: Duration, chat_ttl: Duration) -> Self {
        MemoryPresence {
            ttl,
            chat_ttl,
            state: Mutex::new(PresenceState::default()),
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }
}

impl Default for MemoryPresence {
    fn default() -> Self {
        MemoryPresence::new(Duration::from_secs(60), Duration::from_secs(30))
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_active(&self, user_id: UserId, role: Role) -> MessengerResult<bool> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        let now = Instant::now();
        let was_active = state
            .users
            .get(&user_id)
            .map_or(false, |(_, at)| now.duration_since(*at) < self.ttl);
        state.users.insert(user_id, (role, now));
        Ok(!was_active)
    }

    async fn set_active_in_chat(&self, user_id: UserId, _role: Role, chat_id: ChatId) -> MessengerResult<()> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        state.chats.insert((chat_id, user_id), Instant::now());
        Ok(())
    }

    async fn is_active_in_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<bool> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state
            .chats
            .get(&(chat_id, user_id))
            .map_or(false, |at| at.elapsed() < self.chat_ttl))
    }

    async fn status(&self, user_id: UserId) -> PresenceStatus {
        let state = self.state.lock().await;
        if state.unavailable {
            return PresenceStatus::Indeterminate;
        }
        match state.users.get(&user_id) {
            Some((_, at)) if at.elapsed() < self.ttl => PresenceStatus::Online,
            _ => PresenceStatus::Offline,
        }
    }

    async fn get_active_users(&self, role: Option<Role>, window: Option<Duration>) -> MessengerResult<Vec<UserId>> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        let window = clamp_window(window, self.ttl);
        let mut users: Vec<UserId> = state
            .users
            .iter()
            .filter(|(_, (r, at))| role.map_or(true, |role| role == *r) && at.elapsed() < window)
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort_unstable();
        Ok(users)
    }
}

#[derive(Default)]
struct CounterState {
    values: HashMap<String, i64>,
    unavailable: bool,
}

pub struct MemoryCounters {
    bus: Option<Arc<dyn EventBus>>,
    state: Mutex<CounterState>,
}

impl MemoryCounters {
    pub fn new(bus: Option<Arc<dyn EventBus>>) -> Self {
        MemoryCounters {
            bus,
            state: Mutex::new(CounterState::default()),
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    async fn notify(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType, snapshot: CounterSnapshot) {
        if let Some(bus) = &self.bus {
            publish_counters_changed(bus.as_ref(), user_id, chat_id, chat_type, snapshot).await;
        }
    }
}

#[async_trait]
impl UnreadCounterStore for MemoryCounters {
    async fn increment(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.unavailable {
                return Err(unavailable());
            }
            let mut bump = |key: String| {
                let value = state.values.entry(key).or_insert(0);
                *value += 1;
                *value
            };
            CounterSnapshot {
                by_chat: bump(chat_counter_key(user_id, chat_id)),
                by_chat_type: bump(chat_type_counter_key(user_id, chat_type)),
                total: bump(total_counter_key(user_id)),
            }
        };
        self.notify(user_id, chat_id, chat_type, snapshot).await;
        Ok(snapshot)
    }

    async fn reset(&self, user_id: UserId, chat_id: ChatId, chat_type: ChatType) -> MessengerResult<CounterSnapshot> {
        let (snapshot, removed) = {
            let mut state = self.state.lock().await;
            if state.unavailable {
                return Err(unavailable());
            }
            let removed = state.values.remove(&chat_counter_key(user_id, chat_id)).unwrap_or(0);
            let mut take = |key: String| {
                let remaining = (state.values.get(&key).copied().unwrap_or(0) - removed).max(0);
                if remaining == 0 {
                    state.values.remove(&key);
                } else {
                    state.values.insert(key, remaining);
                }
                remaining
            };
            let snapshot = CounterSnapshot {
                by_chat: 0,
                by_chat_type: take(chat_type_counter_key(user_id, chat_type)),
                total: take(total_counter_key(user_id)),
            };
            (snapshot, removed)
        };
        if removed > 0 {
            self.notify(user_id, chat_id, chat_type, snapshot).await;
        }
        Ok(snapshot)
    }

    async fn get(&self, user_id: UserId) -> MessengerResult<UnreadCounters> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        let by_chat_type = ChatType::ALL
            .iter()
            .map(|t| {
                let value = state.values.get(&chat_type_counter_key(user_id, *t)).copied().unwrap_or(0);
                (*t, value)
            })
            .collect();
        Ok(UnreadCounters {
            total: state.values.get(&total_counter_key(user_id)).copied().unwrap_or(0),
            by_chat_type,
        })
    }

    async fn get_by_chat(&self, user_id: UserId, chat_id: ChatId) -> MessengerResult<i64> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(unavailable());
        }
        Ok(state.values.get(&chat_counter_key(user_id, chat_id)).copied().unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryReplayGuard {
    seen: Mutex<HashSet<String>>,
}

impl MemoryReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayGuard for MemoryReplayGuard {
    async fn first_seen(&self, key: &str) -> MessengerResult<bool> {
        Ok(self.seen.lock().await.insert(key.to_string()))
    }

    async fn forget(&self, key: &str) -> MessengerResult<()> {
        self.seen.lock().await.remove(key);
        Ok(())
    }
}
