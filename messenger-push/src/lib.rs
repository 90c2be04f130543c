pub mod consumer;
pub mod dispatcher;
pub mod payload;
pub mod reaper;
pub mod subscriptions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod webpush;

pub use dispatcher::{DispatchReport, PushDispatcher};
pub use payload::NotificationPayload;
pub use subscriptions::SubscriptionService;
pub use webpush::{PushError, PushTransport, WebPushTransport};
