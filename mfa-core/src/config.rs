//! Configuration for mfa-core

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MfaError, Result};

/// Longest accepted challenge window (one day)
pub const MAX_TTL_SECONDS: u64 = 86_400;

/// Longest accepted TOTP time step
pub const MAX_TOTP_STEP: u64 = 3_600;

/// Main MFA configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MfaConfig {
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub totp: TotpConfig,
    #[serde(default)]
    pub backup_codes: BackupCodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Challenge window and channel code settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChallengeConfig {
    /// Lifetime of a challenge in seconds
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    /// Digits in an sms/email code
    #[serde(default = "default_code_length")]
    pub code_length: usize,
}

/// TOTP parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TotpConfig {
    /// Issuer name (shown in authenticator apps)
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Number of digits in the TOTP code
    #[serde(default = "default_digits")]
    pub digits: usize,
    /// Time step in seconds
    #[serde(default = "default_step")]
    pub step: u64,
    /// Steps scanned either side of now when reporting a delta
    #[serde(default = "default_skew")]
    pub skew: u8,
}

/// Backup code generation and hashing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupCodeConfig {
    #[serde(default = "default_backup_count")]
    pub count: usize,
    #[serde(default = "default_backup_length")]
    pub length: usize,
    /// Argon2 memory cost in KiB
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    /// Argon2 time cost
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Argon2 lanes
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_code_length() -> usize {
    6
}

fn default_issuer() -> String {
    "mfa-core".to_string()
}

fn default_digits() -> usize {
    6
}

fn default_step() -> u64 {
    30
}

fn default_skew() -> u8 {
    1
}

fn default_backup_count() -> usize {
    10
}

fn default_backup_length() -> usize {
    8
}

fn default_memory_kib() -> u32 {
    argon2::Params::DEFAULT_M_COST
}

fn default_iterations() -> u32 {
    argon2::Params::DEFAULT_T_COST
}

fn default_parallelism() -> u32 {
    argon2::Params::DEFAULT_P_COST
}

fn default_database_url() -> String {
    "sqlite://mfa.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            code_length: default_code_length(),
        }
    }
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            digits: default_digits(),
            step: default_step(),
            skew: default_skew(),
        }
    }
}

impl Default for BackupCodeConfig {
    fn default() -> Self {
        Self {
            count: default_backup_count(),
            length: default_backup_length(),
            memory_kib: default_memory_kib(),
            iterations: default_iterations(),
            parallelism: default_parallelism(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChallengeConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

impl MfaConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MfaError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MfaError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_TTL_SECONDS).contains(&self.challenge.ttl_seconds) {
            return Err(MfaError::Config(format!(
                "challenge.ttl_seconds must be between 1 and {}",
                MAX_TTL_SECONDS
            )));
        }
        if !(4..=10).contains(&self.challenge.code_length) {
            return Err(MfaError::Config(
                "challenge.code_length must be between 4 and 10".into(),
            ));
        }
        // totp-rs only accepts 6 to 8 digits
        if !(6..=8).contains(&self.totp.digits) {
            return Err(MfaError::Config("totp.digits must be between 6 and 8".into()));
        }
        if !(1..=MAX_TOTP_STEP).contains(&self.totp.step) {
            return Err(MfaError::Config(format!(
                "totp.step must be between 1 and {}",
                MAX_TOTP_STEP
            )));
        }
        // ':' separates issuer and account in otpauth labels
        if self.totp.issuer.is_empty() || self.totp.issuer.contains(':') {
            return Err(MfaError::Config(
                "totp.issuer must be non-empty and must not contain ':'".into(),
            ));
        }
        if self.backup_codes.count == 0 {
            return Err(MfaError::Config("backup_codes.count must be > 0".into()));
        }
        if self.backup_codes.length < 6 {
            return Err(MfaError::Config("backup_codes.length must be >= 6".into()));
        }
        argon2::Params::new(
            self.backup_codes.memory_kib,
            self.backup_codes.iterations,
            self.backup_codes.parallelism,
            None,
        )
        .map_err(|e| MfaError::Config(format!("invalid backup code hash parameters: {}", e)))?;
        Ok(())
    }
}
