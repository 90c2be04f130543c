//! Cross-process event bus.
//!
//! A process that produces an event for a user it does not hold a connection
//! for publishes it here; whichever process holds the connection is
//! subscribed to that user's channel and delivers it.

pub mod channel;
pub mod envelope;
#[cfg(any(test, feature = "testing"))]
pub mod local;
pub mod redis_bus;

use async_trait::async_trait;
use messenger_core::MessengerResult;
use uuid::Uuid;

pub use channel::Channel;
pub use envelope::BusEnvelope;
#[cfg(any(test, feature = "testing"))]
pub use local::{LocalBusHub, LocalEventBus};
pub use redis_bus::RedisEventBus;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Identity stamped on every envelope this process publishes.
    fn process_id(&self) -> Uuid;

    /// Publishes to the envelope's target channel. Returns how many
    /// processes were subscribed.
    async fn publish(&self, envelope: &BusEnvelope) -> MessengerResult<usize>;

    async fn subscribe(&self, channel: Channel) -> MessengerResult<()>;

    async fn unsubscribe(&self, channel: Channel) -> MessengerResult<()>;
}
