//! Error types for scheme registration and manifest decoding.

use thiserror::Error;
use trainjob_id::IdError;

/// Errors that can occur when registering kinds or decoding manifests.
#[derive(Debug, Error, Clone)]
pub enum ApiError {
    /// The manifest names a kind the scheme does not know.
    #[error("unregistered kind: {api_version}/{kind}")]
    UnregisteredKind { api_version: String, kind: String },

    /// A kind was registered twice.
    #[error("kind already registered: {0}")]
    AlreadyRegistered(String),

    /// The manifest is structurally valid JSON but not a usable job.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// The manifest metadata does not form a valid job key.
    #[error("invalid job key: {0}")]
    InvalidKey(#[from] IdError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Serialization(err.to_string())
    }
}
