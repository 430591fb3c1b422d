use thiserror::Error;

/// Result type for autosrv
pub type Result<T> = std::result::Result<T, AutosrvError>;

/// Errors that can occur in autosrv
#[derive(Error, Debug)]
pub enum AutosrvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Task timed out after {0} seconds")]
    TaskTimeout(u64),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl From<rumqttc::ClientError> for AutosrvError {
    fn from(err: rumqttc::ClientError) -> Self {
        AutosrvError::BrokerError(err.to_string())
    }
}
