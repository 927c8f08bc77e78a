//! TOTP (Time-based One-Time Password) service
//!
//! Implements RFC 6238 for TOTP generation and validation.

use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::codes::{constant_time_eq, normalize_numeric_code};
use crate::config::TotpConfig;
use crate::error::{MfaError, Result};
use crate::types::TotpEnrollment;

/// TOTP capability used by the registry and the verifier
pub trait TotpProvider: Send + Sync {
    /// Generate a fresh shared secret plus its provisioning payload
    fn generate_secret(&self, account_name: &str) -> Result<TotpEnrollment>;

    /// Compare `code` with the codes around `at`.
    ///
    /// Returns the time-step delta of the matching code, or `None` when no
    /// step in the scanned window matches.
    fn verify(&self, secret: &str, code: &str, at: DateTime<Utc>) -> Result<Option<i64>>;
}

/// TOTP service backed by `totp-rs`
#[derive(Debug, Clone)]
pub struct TotpService {
    config: TotpConfig,
}

impl TotpService {
    /// Create a new TOTP service with default configuration
    pub fn new() -> Self {
        Self {
            config: TotpConfig::default(),
        }
    }

    /// Create a new TOTP service with custom configuration
    pub fn with_config(config: TotpConfig) -> Self {
        Self { config }
    }

    /// Generate the code for the time step containing `at`
    pub fn generate_at(&self, secret_base32: &str, at: DateTime<Utc>) -> Result<String> {
        let totp = self.build_totp(secret_base32, String::new())?;
        Ok(totp.generate(unix_seconds(at)?))
    }

    fn build_totp(&self, secret_base32: &str, account_name: String) -> Result<TOTP> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| MfaError::Crypto(format!("Invalid TOTP secret: {:?}", e)))?;

        TOTP::new(
            Algorithm::SHA1,
            self.config.digits,
            self.config.skew,
            self.config.step,
            secret,
            Some(self.config.issuer.clone()),
            account_name,
        )
        .map_err(|e| MfaError::Crypto(format!("Failed to create TOTP: {:?}", e)))
    }
}

impl Default for TotpService {
    fn default() -> Self {
        Self::new()
    }
}

impl TotpProvider for TotpService {
    fn generate_secret(&self, account_name: &str) -> Result<TotpEnrollment> {
        let secret = Secret::generate_secret().to_encoded().to_string();

        // otpauth labels use ':' as the issuer separator
        let totp = self.build_totp(&secret, account_name.replace(':', "_"))?;
        let provisioning_uri = totp.get_url();
        let qr_code = totp
            .get_qr_base64()
            .map_err(|e| MfaError::Crypto(format!("Failed to generate QR code: {}", e)))?;

        Ok(TotpEnrollment {
            secret,
            provisioning_uri,
            qr_code: format!("data:image/png;base64,{}", qr_code),
        })
    }

    fn verify(&self, secret: &str, code: &str, at: DateTime<Utc>) -> Result<Option<i64>> {
        let totp = self.build_totp(secret, String::new())?;
        let code = normalize_numeric_code(code);
        if code.len() != self.config.digits {
            return Ok(None);
        }

        let now = unix_seconds(at)?;
        let step = self.config.step;
        let skew = i64::from(self.config.skew);

        // Exact step first, then outward
        let mut deltas = vec![0i64];
        for d in 1..=skew {
            deltas.push(-d);
            deltas.push(d);
        }

        for delta in deltas {
            let offset = delta * step as i64;
            let Some(time) = (now as i64).checked_add(offset).filter(|t| *t >= 0) else {
                continue;
            };
            if constant_time_eq(&totp.generate(time as u64), &code) {
                return Ok(Some(delta));
            }
        }

        Ok(None)
    }
}

fn unix_seconds(at: DateTime<Utc>) -> Result<u64> {
    u64::try_from(at.timestamp())
        .map_err(|_| MfaError::Crypto("time before unix epoch".to_string()))
}
