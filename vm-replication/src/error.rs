use thiserror::Error;

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported schema version {found} (current is {current})")]
    UnsupportedSchema { found: u32, current: u32 },

    #[error("Failed to apply {feed} message: {source}")]
    Apply {
        feed: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReplicationError {
    /// Errors after which the subscription can no longer be trusted.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ReplicationError::BrokerUnavailable(_))
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for ReplicationError {
    fn from(err: lapin::Error) -> Self {
        ReplicationError::BrokerUnavailable(err.to_string())
    }
}
