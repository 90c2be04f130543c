//! Connection registry, command dispatch and fan-out.

pub mod dispatcher;
pub mod emission;
pub mod fanout;
pub mod handlers;
pub mod push_signals;
pub mod registry;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use emission::{Audience, Emission, PushRequest, Recipient};
pub use fanout::{run_inbound, Fanout, FanoutReport};
pub use handlers::{ChatServices, CommandContext, CommandHandler};
pub use push_signals::{BrokerPushSignals, PushSignalSink};
pub use registry::{ConnectionHandle, ConnectionRegistry, Registration, RegistryStats};
