use thiserror::Error;

use crate::common::error::MetaqError::GenericError;

#[derive(Debug, Error)]
pub enum MetaqError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Object store error: {0}")]
    StoreError(#[from] object_store::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Unknown backend `{0}`, supported backends: {1}")]
    UnknownBackend(String, String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for MetaqError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for MetaqError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<zip::result::ZipError> for MetaqError {
    fn from(error: zip::result::ZipError) -> Self {
        Self::GenericError(format!("Cannot create archive: {error}"))
    }
}

impl From<anyhow::Error> for MetaqError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

pub fn config_error<T>(message: String) -> crate::Result<T> {
    Err(MetaqError::ConfigError(message))
}

impl From<String> for MetaqError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
