//! Error types for the activation client.
//!
//! The variants follow the protocol's failure taxonomy: fatal input errors
//! (bad credentials, unknown region, malformed token, short handshake hint),
//! transport failures (socket, HTTP framing), and decode failures (base64,
//! decrypt, unpad, JSON). Protocol-level error codes returned by the server
//! are *not* errors — they are carried inside a decoded
//! [`ActivationResponse`](crate::messages::ActivationResponse) and drive the
//! orchestrator's retry logic instead.

use thiserror::Error;

/// Result type used throughout the crate.
pub type ActivationResult<T> = Result<T, ActivationError>;

/// Errors that abort an activation run.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Device credentials failed pre-flight validation.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The provisioning token's region prefix is not one we know.
    #[error("unable to determine region from token prefix {0:?}")]
    UnknownRegion(String),

    /// The provisioning token is too short or otherwise malformed.
    #[error("malformed provisioning token: {0}")]
    MalformedToken(String),

    /// The server-supplied PSK hint was shorter than the 16 bytes the
    /// derivation consumes. This fails the connection attempt rather than
    /// silently truncating.
    #[error("PSK handshake hint too short: got {0} bytes, need at least 16")]
    HintTooShort(usize),

    /// Socket-level or TLS-handshake failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The response could not be decoded (HTTP framing, JSON envelope,
    /// base64, AES decrypt, or PKCS#7 unpad failure).
    #[error("malformed response: {0}")]
    Decode(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Waiting for a multicast token was cancelled.
    #[error("cancelled while waiting for provisioning token")]
    Cancelled,

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<openssl::error::ErrorStack> for ActivationError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        ActivationError::Transport(format!("TLS error: {e}"))
    }
}
