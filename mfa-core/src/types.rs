//! MFA types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MfaError, Result};

/// Kind of second factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    /// Time-based one-time code from an authenticator app
    Totp,
    /// Numeric code delivered by SMS
    Sms,
    /// Numeric code delivered by email
    Email,
    /// Single-use recovery code
    Backup,
}

impl MethodKind {
    /// Get the storage name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Totp => "totp",
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Backup => "backup",
        }
    }

    /// Parse a kind from its storage name
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "totp" => Ok(Self::Totp),
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            "backup" => Ok(Self::Backup),
            other => Err(MfaError::Unsupported(format!("unknown method kind '{}'", other))),
        }
    }

    /// Whether codes for this kind are generated by us and sent out-of-band
    pub fn is_channel(&self) -> bool {
        matches!(self, Self::Sms | Self::Email)
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One enrolled second factor for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaMethod {
    pub id: Uuid,
    pub user_id: String,
    pub kind: MethodKind,
    /// TOTP base32 secret, or the Argon2 hash of a backup code
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Phone number or email address for channel kinds
    pub destination: Option<String>,
    pub is_primary: bool,
    pub is_verified: bool,
    pub enrolled_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MfaMethod {
    /// Create a new unverified, non-primary method
    pub fn new(
        user_id: impl Into<String>,
        kind: MethodKind,
        secret: Option<String>,
        destination: Option<String>,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            kind,
            secret,
            destination,
            is_primary: false,
            is_verified: false,
            enrolled_at,
            last_used_at: None,
        }
    }
}

/// Lifecycle state of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    Outstanding,
    Consumed,
    Discarded,
}

impl ChallengeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outstanding => "outstanding",
            Self::Consumed => "consumed",
            Self::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "outstanding" => Ok(Self::Outstanding),
            "consumed" => Ok(Self::Consumed),
            "discarded" => Ok(Self::Discarded),
            other => Err(MfaError::Storage(format!("unknown challenge state '{}'", other))),
        }
    }
}

/// What a challenge was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePurpose {
    /// Confirms a freshly registered sms/email method
    Enrollment,
    /// Login-time second factor
    Authentication,
}

impl ChallengePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::Authentication => "authentication",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "enrollment" => Ok(Self::Enrollment),
            "authentication" => Ok(Self::Authentication),
            other => Err(MfaError::Storage(format!("unknown challenge purpose '{}'", other))),
        }
    }
}

/// A single authentication attempt window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaChallenge {
    pub id: Uuid,
    pub user_id: String,
    pub method_id: Uuid,
    pub purpose: ChallengePurpose,
    /// One-time code for channel kinds; never set for totp/backup
    #[serde(skip_serializing)]
    pub code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
}

impl MfaChallenge {
    /// Create an outstanding challenge expiring `ttl` after `created_at`
    pub fn new(
        method: &MfaMethod,
        purpose: ChallengePurpose,
        code: Option<String>,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: method.user_id.clone(),
            method_id: method.id,
            purpose,
            code,
            created_at,
            expires_at: created_at + ttl,
            state: ChallengeState::Outstanding,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.state == ChallengeState::Outstanding
    }

    /// Expired once the clock is strictly past `expires_at`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Options for registering a new method
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegisterOptions {
    /// Phone number or email address (required for sms/email)
    pub destination: Option<String>,
    /// Account label shown in authenticator apps (defaults to the user id)
    pub account_name: Option<String>,
}

impl RegisterOptions {
    pub fn with_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Default::default()
        }
    }
}

/// TOTP enrollment payload for out-of-band display
#[derive(Debug, Clone, Serialize)]
pub struct TotpEnrollment {
    /// The secret in base32 format (for manual entry)
    pub secret: String,
    /// The provisioning URI for authenticator apps
    pub provisioning_uri: String,
    /// QR code as data URI (base64 PNG)
    pub qr_code: String,
}

/// Result of registering a method
#[derive(Debug, Clone)]
pub struct Registration {
    pub method: MfaMethod,
    /// Present for totp registrations
    pub totp: Option<TotpEnrollment>,
    /// Enrollment challenge carrying the code sent for sms/email
    pub enrollment_challenge_id: Option<Uuid>,
}

/// Successful second-factor verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub user_id: String,
    pub method_id: Uuid,
    pub kind: MethodKind,
}

/// MFA summary for a user
#[derive(Debug, Clone, Serialize)]
pub struct MfaStatus {
    /// Whether the user has at least one verified method
    pub is_enabled: bool,
    pub primary_method: Option<Uuid>,
    pub verified_methods: usize,
    pub pending_methods: usize,
    pub backup_codes_remaining: usize,
    /// Most recent successful verification across methods
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MfaStatus {
    /// Summarise a user's method set
    pub fn from_methods(methods: &[MfaMethod]) -> Self {
        let verified_methods = methods.iter().filter(|m| m.is_verified).count();
        Self {
            is_enabled: verified_methods > 0,
            primary_method: methods.iter().find(|m| m.is_primary).map(|m| m.id),
            verified_methods,
            pending_methods: methods.len() - verified_methods,
            backup_codes_remaining: methods
                .iter()
                .filter(|m| m.kind == MethodKind::Backup)
                .count(),
            last_used_at: methods.iter().filter_map(|m| m.last_used_at).max(),
        }
    }
}

/// Types of MFA events for audit logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MfaEventType {
    MethodRegistered,
    EnrollmentConfirmed,
    PrimaryChanged,
    MethodRemoved,
    ChallengeIssued,
    ChallengeCancelled,
    VerifySuccess,
    VerifyFailed,
    BackupCodeUsed,
    BackupCodesGenerated,
}

impl std::fmt::Display for MfaEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MfaEventType::MethodRegistered => write!(f, "method_registered"),
            MfaEventType::EnrollmentConfirmed => write!(f, "enrollment_confirmed"),
            MfaEventType::PrimaryChanged => write!(f, "primary_changed"),
            MfaEventType::MethodRemoved => write!(f, "method_removed"),
            MfaEventType::ChallengeIssued => write!(f, "challenge_issued"),
            MfaEventType::ChallengeCancelled => write!(f, "challenge_cancelled"),
            MfaEventType::VerifySuccess => write!(f, "verify_success"),
            MfaEventType::VerifyFailed => write!(f, "verify_failed"),
            MfaEventType::BackupCodeUsed => write!(f, "backup_code_used"),
            MfaEventType::BackupCodesGenerated => write!(f, "backup_codes_generated"),
        }
    }
}

/// MFA audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaAuditEntry {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: MfaEventType,
    pub method_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl MfaAuditEntry {
    pub fn new(
        user_id: impl Into<String>,
        event_type: MfaEventType,
        method_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            event_type,
            method_id,
            created_at,
        }
    }
}
