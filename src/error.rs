//! Error types for rscdm.

use thiserror::Error;

/// Main error type for CDM operations.
///
/// Failures are reported through `Result`, never panicked. Success signals
/// (key message built, keys added, request canceled) are ordinary return
/// values of the operations that produce them.
#[derive(Debug, Error)]
pub enum Error {
    /// Internal or precondition failure with no more specific cause.
    #[error("Unknown error: {0}")]
    Unknown(String),

    /// Malformed or unparseable protocol data.
    #[error("Key error: {0}")]
    KeyError(String),

    /// Policy requires the caller to re-request keys.
    #[error("Key re-request required: {0}")]
    NeedKey(String),

    /// Device identity is missing or invalid; provisioning is required first.
    #[error("Provisioning required: {0}")]
    NeedProvisioning(String),

    /// The server revoked this device. No retry is meaningful without new
    /// provisioning.
    #[error("Device revoked: {0}")]
    DeviceRevoked(String),

    /// The secure engine has no free sessions or key slots.
    #[error("Insufficient crypto resources: {0}")]
    InsufficientCryptoResources(String),

    /// A signature failed to verify. Fatal to the exchange.
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// A freshness nonce was missing or did not match. Treated as a protocol
    /// integrity failure, not a transient error.
    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),

    /// No session is open with the specified identifier.
    #[error("Session identifier {0:?} is invalid")]
    InvalidSession(String),

    /// No persisted license exists for the key set identifier.
    #[error("Key set {0:?} is invalid")]
    InvalidKeySet(String),

    /// Too many sessions are open.
    #[error("Too many sessions open (max {max})")]
    TooManySessions { max: usize },

    /// The key system string is not handled by this engine.
    #[error("Unsupported key system: {0}")]
    UnsupportedKeySystem(String),

    /// A stored record failed its integrity hash or envelope checks.
    #[error("Stored record failed verification: {0}")]
    StoreIntegrity(String),

    /// The init data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Failed to parse protobuf message.
    #[error("Protobuf decode error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),

    /// RSA error.
    #[error("RSA error: {0}")]
    RsaError(#[from] rsa::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for rscdm operations.
pub type Result<T> = std::result::Result<T, Error>;
