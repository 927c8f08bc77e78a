//! One-time code generation, normalisation and hashing
//!
//! All randomness comes from the operating system CSPRNG.

use argon2::{
    password_hash::{rand_core::OsRng as SaltRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{rngs::OsRng, Rng};
use subtle::ConstantTimeEq;

use crate::config::BackupCodeConfig;
use crate::error::{MfaError, Result};

/// Backup code alphabet: uppercase letters and digits
pub const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generate a numeric code of `length` digits (leading zeros kept)
pub fn generate_numeric_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Generate a random backup code of `length` characters
pub fn generate_backup_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..BACKUP_CODE_CHARSET.len());
            BACKUP_CODE_CHARSET[idx] as char
        })
        .collect()
}

/// Normalize user input: remove spaces and dashes, uppercase
pub fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Whether an already normalized code has the backup code shape
pub fn is_backup_code_format(code: &str, length: usize) -> bool {
    code.len() == length && code.bytes().all(|b| BACKUP_CODE_CHARSET.contains(&b))
}

/// Remove spaces and dashes some users copy along with numeric codes
pub fn normalize_numeric_code(code: &str) -> String {
    code.replace([' ', '-'], "")
}

/// Constant-time string comparison to prevent timing attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Argon2 hasher for backup codes at rest
#[derive(Clone)]
pub struct BackupCodeHasher {
    argon2: Argon2<'static>,
}

impl BackupCodeHasher {
    pub fn new(config: &BackupCodeConfig) -> Result<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| MfaError::Config(format!("invalid backup code hash parameters: {}", e)))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a normalized code into PHC string format
    pub fn hash(&self, code: &str) -> Result<String> {
        let salt = SaltString::generate(&mut SaltRng);
        self.argon2
            .hash_password(code.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| MfaError::Crypto(format!("Failed to hash backup code: {}", e)))
    }

    /// Check a normalized code against a stored hash
    pub fn verify(&self, code: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => self.argon2.verify_password(code.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for BackupCodeHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupCodeHasher").finish_non_exhaustive()
    }
}
