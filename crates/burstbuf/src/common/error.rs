use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Burst buffer error: {0}")]
    CoreError(#[from] bbcore::Error),
    #[error("Version error: {0}")]
    VersionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("{operation} failed: {message}")]
    OperationFailure {
        operation: &'static str,
        message: String,
        /// The operation was abandoned because the controller is shutting down
        shutdown: bool,
    },
    #[error("Cannot recover burst buffer state: {0}")]
    RecoveryError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for Error {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:#}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
