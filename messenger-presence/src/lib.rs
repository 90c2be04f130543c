//! Per-user state shared by every process: presence, unread counters and
//! receipt replay keys, all kept in Redis.

pub mod counters;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod presence;
pub mod replay;

pub use counters::{CounterSnapshot, RedisUnreadCounters, UnreadCounterStore};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryCounters, MemoryPresence, MemoryReplayGuard};
pub use presence::{PresenceStatus, PresenceStore, RedisPresence};
pub use replay::{receipt_key, ReceiptKind, RedisReplayGuard, ReplayGuard};
