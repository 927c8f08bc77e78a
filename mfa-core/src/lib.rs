//! mfa-core: Multi-factor authentication enrollment and challenge engine
//!
//! Owns a user's second-factor methods, issues time-bounded challenges against
//! them and verifies submitted codes. Session issuance after a successful
//! factor is left to the caller.
//!
//! # Components
//!
//! - [`MethodRegistry`]: register, confirm, promote and remove methods
//! - [`ChallengeIssuer`]: issue and cancel challenges, sending sms/email codes
//! - [`ChallengeVerifier`]: check codes against outstanding challenges
//! - [`BackupCodeGenerator`]: mint single-use recovery codes
//!
//! # Example
//!
//! ```no_run
//! use mfa_core::{ConsoleChannel, InMemoryStore, MethodKind, MfaConfig, MfaService, RegisterOptions};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = MfaService::new(
//!     MfaConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(ConsoleChannel),
//! )?;
//!
//! // Enroll an authenticator app
//! let registration = service
//!     .registry()
//!     .register_method("user-42", MethodKind::Totp, RegisterOptions::default())
//!     .await?;
//! println!("Scan: {}", registration.totp.unwrap().provisioning_uri);
//!
//! // Later: confirm with the first code shown by the app
//! service.registry().confirm_enrollment(registration.method.id, "123456").await?;
//!
//! // On every login
//! let challenge = service.issuer().issue_challenge("user-42", None).await?;
//! service.verifier().verify_challenge(challenge.challenge_id, "654321").await?;
//! # Ok(())
//! # }
//! ```

pub mod backup;
pub mod clock;
pub mod codes;
pub mod config;
mod context;
pub mod delivery;
pub mod error;
pub mod issuer;
pub mod locks;
pub mod logging;
pub mod registry;
pub mod service;
pub mod store;
pub mod totp;
pub mod types;
pub mod verifier;

// Re-export commonly used types
pub use backup::{BackupCodeGenerator, BackupCodes};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MfaConfig;
pub use delivery::{ConsoleChannel, DeliveryChannel};
pub use error::{MfaError, Result};
pub use issuer::{ChallengeIssuer, IssuedChallenge};
pub use registry::MethodRegistry;
pub use service::MfaService;
pub use store::{Change, InMemoryStore, Invariant, MfaStore, SqliteStore};
pub use totp::{TotpProvider, TotpService};
pub use types::*;
pub use verifier::ChallengeVerifier;
