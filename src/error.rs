//! Error types for dagcache
//!
//! All modules use `CacheResult<T>` as their return type. `CacheError` is
//! `Clone` so that a single failed execution can be handed to every waiter
//! that joined it.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for dagcache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Boxed error produced by a compute function
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// All errors that can occur in dagcache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    // Call errors
    #[error("recursive call detected")]
    RecursiveCall,

    #[error("call canceled: {cause}")]
    Canceled { cause: String },

    #[error("{0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("no session id available for ttl-scoped call")]
    MissingSession,

    #[error("failed to reconstruct object result: {0}")]
    ObjectReconstruct(String),

    #[error("failed to decode call id: {0}")]
    Decode(String),

    // Release errors
    #[error("release failed: {}", join_messages(.0))]
    Release(Vec<CacheError>),

    // Session errors
    #[error("session cache is closed")]
    SessionClosed,

    #[error("session cache was closed during execution")]
    SessionClosedDuringExecution,

    // Store errors
    #[error("expiration store error: {0}")]
    Store(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("TOML parse error: {0}")]
    TomlParse(Arc<toml::de::Error>),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(Arc<toml::ser::Error>),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

fn join_messages(errors: &[CacheError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        Self::TomlParse(Arc::new(err))
    }
}

impl From<toml::ser::Error> for CacheError {
    fn from(err: toml::ser::Error) -> Self {
        Self::TomlSerialize(Arc::new(err))
    }
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an arbitrary failure returned by a compute function
    pub fn compute(err: impl Into<BoxError>) -> Self {
        Self::Compute(Arc::from(err.into()))
    }

    /// Create a compute error from a plain message
    pub fn msg(message: impl Into<String>) -> Self {
        Self::compute(message.into())
    }

    /// Create a cancellation error with the given cause
    pub fn canceled(cause: impl Into<String>) -> Self {
        Self::Canceled {
            cause: cause.into(),
        }
    }

    /// Join several release failures into one error.
    ///
    /// Returns `Ok(())` when the list is empty and the error itself when
    /// there is exactly one.
    pub fn join(mut errors: Vec<CacheError>) -> CacheResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Release(errors)),
        }
    }

    /// Check if this is a recursive call error
    pub fn is_recursive_call(&self) -> bool {
        matches!(self, Self::RecursiveCall)
    }

    /// Check if this error came from the caller's own cancellation
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Canceled { .. } | Self::Compute(_) | Self::Store(_) | Self::Io { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::RecursiveCall => Some("A call depends on its own result; break the cycle"),
            Self::SessionClosed => Some("Open a new session before issuing calls"),
            Self::MissingSession => Some("Attach a session id to the call scope"),
            Self::ConfigInvalid { .. } => Some("Run: dagcache config init --force"),
            _ => None,
        }
    }
}
