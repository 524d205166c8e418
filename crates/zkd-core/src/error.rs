use thiserror::Error;

use crate::types::ConflictInfo;

pub type ZkdResult<T> = Result<T, ZkdError>;

#[derive(Debug, Error)]
pub enum ZkdError {
    /// No session key is cached; the user must unlock before any key operation.
    #[error("key unavailable: no session key cached")]
    KeyUnavailable,

    #[error("key unwrap failed: wrong key or corrupted envelope")]
    UnwrapFailed,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("manifest mismatch: expected {expected}, got {actual}")]
    ManifestMismatch { expected: String, actual: String },

    #[error("manifest signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("name conflict: {} already exists", .0.conflicting_name)]
    Conflict(ConflictInfo),

    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("transfer URL expired")]
    UrlExpired,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("incomplete upload: chunks {missing:?} missing after confirm rounds")]
    IncompleteUpload { missing: Vec<u64> },

    #[error("range not satisfiable: start {start} for object of {size} bytes")]
    RangeNotSatisfiable { start: u64, size: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation paused")]
    Paused,

    /// A server response that is well-formed JSON but cannot describe a valid object
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ZkdError {
    /// Whether retrying the same operation can succeed.
    ///
    /// Cryptographic failures, manifest mismatches and control-flow signals
    /// are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZkdError::NetworkTransient(_) | ZkdError::UrlExpired)
    }

    /// Cancellation and pause are control-flow signals, not failures.
    pub fn is_interruption(&self) -> bool {
        matches!(self, ZkdError::Cancelled | ZkdError::Paused)
    }

    /// Produce an equivalent error for fan-out to several waiters.
    ///
    /// Variants wrapping non-cloneable sources degrade to their message.
    pub fn duplicate(&self) -> ZkdError {
        match self {
            ZkdError::KeyUnavailable => ZkdError::KeyUnavailable,
            ZkdError::UnwrapFailed => ZkdError::UnwrapFailed,
            ZkdError::DecryptionFailed(m) => ZkdError::DecryptionFailed(m.clone()),
            ZkdError::ManifestMismatch { expected, actual } => ZkdError::ManifestMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            ZkdError::SignatureInvalid(m) => ZkdError::SignatureInvalid(m.clone()),
            ZkdError::Conflict(info) => ZkdError::Conflict(info.clone()),
            ZkdError::NetworkTransient(m) => ZkdError::NetworkTransient(m.clone()),
            ZkdError::UrlExpired => ZkdError::UrlExpired,
            ZkdError::Api { status, message } => ZkdError::Api {
                status: *status,
                message: message.clone(),
            },
            ZkdError::IncompleteUpload { missing } => ZkdError::IncompleteUpload {
                missing: missing.clone(),
            },
            ZkdError::RangeNotSatisfiable { start, size } => ZkdError::RangeNotSatisfiable {
                start: *start,
                size: *size,
            },
            ZkdError::Cancelled => ZkdError::Cancelled,
            ZkdError::Paused => ZkdError::Paused,
            ZkdError::Protocol(m) => ZkdError::Protocol(m.clone()),
            ZkdError::Crypto(m) => ZkdError::Crypto(m.clone()),
            ZkdError::Storage(m) => ZkdError::Storage(m.clone()),
            ZkdError::Config(m) => ZkdError::Config(m.clone()),
            ZkdError::Serialization(m) => ZkdError::Serialization(m.clone()),
            ZkdError::Io(e) => ZkdError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ZkdError::Other(e) => ZkdError::Other(anyhow::anyhow!("{e:#}")),
        }
    }
}

impl From<serde_json::Error> for ZkdError {
    fn from(e: serde_json::Error) -> Self {
        ZkdError::Serialization(e.to_string())
    }
}
