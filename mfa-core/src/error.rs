use thiserror::Error;

/// MFA error types
///
/// The first six variants are the domain outcomes callers branch on; the rest
/// wrap infrastructure failures from the injected collaborators.
#[derive(Error, Debug)]
pub enum MfaError {
    /// Method or challenge absent, or challenge already consumed/discarded
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation requires a verified method
    #[error("Method is not verified: {0}")]
    Unverified(String),

    /// Challenge is past its window
    #[error("Challenge expired")]
    Expired,

    /// Submitted code did not match
    #[error("Invalid code")]
    InvalidCode,

    /// Operation would break a per-user method invariant
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Method kind cannot be used this way (e.g. missing destination)
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MfaError>;
