use thiserror::Error;

/// Failure taxonomy shared by every messenger crate.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Bad command payload. Reported to the originating connection only.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Read/write failure on a client connection. The connection is closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Redis could not be reached after retries.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("push rejected: {0}")]
    PushRejected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MessengerError {
    /// Errors caused by the client's own command, as opposed to the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MessengerError::Validation(_) | MessengerError::NotPermitted(_) | MessengerError::NotFound(_)
        )
    }
}

impl From<redis::RedisError> for MessengerError {
    fn from(e: redis::RedisError) -> Self {
        MessengerError::CacheUnavailable(e.to_string())
    }
}

impl From<diesel::result::Error> for MessengerError {
    fn from(e: diesel::result::Error) -> Self {
        match e {
            diesel::result::Error::NotFound => MessengerError::NotFound("record".to_string()),
            other => MessengerError::Storage(other.to_string()),
        }
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(e: bincode::Error) -> Self {
        MessengerError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(e: serde_json::Error) -> Self {
        MessengerError::Serialization(e.to_string())
    }
}

pub type MessengerResult<T> = Result<T, MessengerError>;
