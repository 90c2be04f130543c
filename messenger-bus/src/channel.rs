use messenger_core::types::{ConnectionId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX: &str = "messenger:updates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Every process holding at least one connection of the user.
    User(UserId),
    /// The single process holding this connection.
    Connection(ConnectionId),
    /// Every process.
    Broadcast,
}

impl Channel {
    pub fn name(&self) -> String {
        match self {
            Channel::User(user_id) => format!("{}:user:{}", PREFIX, user_id),
            Channel::Connection(connection_id) => format!("{}:conn:{}", PREFIX, connection_id),
            Channel::Broadcast => format!("{}:broadcast", PREFIX),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn channel_names_are_namespaced() {
        assert_eq!(Channel::User(42).name(), "messenger:updates:user:42");
        assert_eq!(Channel::Broadcast.name(), "messenger:updates:broadcast");
        let cid = Uuid::nil();
        assert_eq!(
            Channel::Connection(cid).name(),
            "messenger:updates:conn:00000000-0000-0000-0000-000000000000"
        );
    }
}
