//! Error types for the core library.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A configuration-related error.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No cached credential exists.
    #[error("secret not found: {0}")]
    SecretNotFound(String),

    /// The cached credential exists but could not be parsed.
    #[error("token cache is corrupt: {0}")]
    CorruptCache(String),

    /// A lookup returned no matching identity.
    #[error("not found: {0}")]
    NotFound(String),

    /// The platform refused an event subscription.
    #[error("subscription rejected with status {status}: {body}")]
    Subscription {
        /// HTTP status code returned by the registration call.
        status: u16,
        /// Response body, kept for diagnostics.
        body: String,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    Parse(String),

    /// The real-time transport failed or was closed by the peer.
    #[error("transport error: {0}")]
    Transport(String),

    /// The client was used after `close()`.
    #[error("client is closed")]
    Closed,

    /// An API or HTTP error.
    #[error("API error: {0}")]
    Api(String),

    /// A generic error for other cases.
    #[error("error: {0}")]
    Other(String),
}

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;
