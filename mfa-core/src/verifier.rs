//! Challenge verification
//!
//! Kind-specific code checks live in [`CodeChecker`], which the registry also
//! uses to confirm enrollments, so both paths accept exactly the same codes.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codes::{
    constant_time_eq, is_backup_code_format, normalize_backup_code, normalize_numeric_code,
    BackupCodeHasher,
};
use crate::context::MfaContext;
use crate::error::{MfaError, Result};
use crate::registry::successor_primary;
use crate::store::{Change, Invariant};
use crate::totp::TotpProvider;
use crate::types::{
    ChallengePurpose, ChallengeState, MethodKind, MfaChallenge, MfaEventType, MfaMethod,
    Verification,
};

/// Kind-specific code validation
#[derive(Clone)]
pub(crate) struct CodeChecker {
    pub totp: Arc<dyn TotpProvider>,
    pub hasher: BackupCodeHasher,
    pub backup_length: usize,
}

impl CodeChecker {
    /// Check `code` against `method`, using `challenge` for channel kinds.
    ///
    /// Returns `InvalidCode` on mismatch.
    pub async fn check(
        &self,
        method: &MfaMethod,
        challenge: Option<&MfaChallenge>,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let matched = match method.kind {
            MethodKind::Totp => {
                let secret = method
                    .secret
                    .as_deref()
                    .ok_or_else(|| MfaError::Storage(format!("totp method {} has no secret", method.id)))?;
                // Only the exact time step counts
                self.totp.verify(secret, code, now)? == Some(0)
            }
            MethodKind::Sms | MethodKind::Email => {
                let expected = challenge.and_then(|c| c.code.as_deref()).ok_or_else(|| {
                    MfaError::Storage(format!("channel challenge for method {} has no code", method.id))
                })?;
                constant_time_eq(&normalize_numeric_code(code), expected)
            }
            MethodKind::Backup => {
                let code = normalize_backup_code(code);
                if !is_backup_code_format(&code, self.backup_length) {
                    return Err(MfaError::InvalidCode);
                }
                let hash = method
                    .secret
                    .clone()
                    .ok_or_else(|| MfaError::Storage(format!("backup method {} has no hash", method.id)))?;
                let hasher = self.hasher.clone();
                tokio::task::spawn_blocking(move || hasher.verify(&code, &hash))
                    .await
                    .map_err(|e| MfaError::Crypto(format!("hash task failed: {}", e)))?
            }
        };

        if matched {
            Ok(())
        } else {
            Err(MfaError::InvalidCode)
        }
    }

    /// Find the backup method whose hash matches `code`
    pub async fn find_backup(&self, code: &str, candidates: &[MfaMethod]) -> Result<Option<Uuid>> {
        let code = normalize_backup_code(code);
        if !is_backup_code_format(&code, self.backup_length) {
            return Ok(None);
        }

        let hashes: Vec<(Uuid, String)> = candidates
            .iter()
            .filter(|m| m.kind == MethodKind::Backup)
            .filter_map(|m| m.secret.clone().map(|s| (m.id, s)))
            .collect();
        let hasher = self.hasher.clone();

        tokio::task::spawn_blocking(move || {
            hashes
                .into_iter()
                .find(|(_, hash)| hasher.verify(&code, hash))
                .map(|(id, _)| id)
        })
        .await
        .map_err(|e| MfaError::Crypto(format!("hash task failed: {}", e)))
    }
}

/// Validates submitted codes against outstanding challenges
#[derive(Clone)]
pub struct ChallengeVerifier {
    ctx: MfaContext,
    checker: CodeChecker,
}

impl ChallengeVerifier {
    pub(crate) fn new(ctx: MfaContext, checker: CodeChecker) -> Self {
        Self { ctx, checker }
    }

    /// Verify `submitted_code` against an outstanding authentication challenge.
    ///
    /// A wrong code leaves the challenge usable until it expires. An expired
    /// challenge is discarded and reported as `Expired` whatever the code.
    pub async fn verify_challenge(&self, challenge_id: Uuid, submitted_code: &str) -> Result<Verification> {
        let user_id = self.ctx.challenge(challenge_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        // Re-read under the guard; a concurrent verify may have consumed it
        let mut challenge = self.ctx.challenge(challenge_id).await?;
        if !challenge.is_outstanding() || challenge.purpose != ChallengePurpose::Authentication {
            return Err(MfaError::NotFound(format!("challenge {}", challenge_id)));
        }

        let now = self.ctx.clock.now();
        if challenge.is_expired_at(now) {
            challenge.state = ChallengeState::Discarded;
            self.ctx.store.put_challenge(challenge).await?;
            debug!(%challenge_id, "Challenge expired");
            return Err(MfaError::Expired);
        }

        let Some(mut method) = self.ctx.store.get_method(challenge.method_id).await? else {
            return Err(MfaError::NotFound(format!("method {}", challenge.method_id)));
        };

        if let Err(e) = self.checker.check(&method, Some(&challenge), submitted_code, now).await {
            if matches!(e, MfaError::InvalidCode) {
                warn!(%user_id, %challenge_id, "MFA verification failed");
                self.ctx
                    .audit(&user_id, MfaEventType::VerifyFailed, Some(method.id))
                    .await;
            }
            return Err(e);
        }

        challenge.state = ChallengeState::Consumed;
        let mut changes = vec![Change::PutChallenge(challenge)];

        let verification = Verification {
            user_id: user_id.clone(),
            method_id: method.id,
            kind: method.kind,
        };

        if method.kind == MethodKind::Backup {
            changes.extend(self.consume_backup(&method, Some(challenge_id)).await?);
            self.ctx.store.commit(changes).await?;
            self.ctx
                .audit(&user_id, MfaEventType::BackupCodeUsed, Some(verification.method_id))
                .await;
        } else {
            method.last_used_at = Some(now);
            changes.push(Change::UpdateMethod(method));
            self.ctx.store.commit(changes).await?;
        }

        self.ctx
            .audit(&user_id, MfaEventType::VerifySuccess, Some(verification.method_id))
            .await;
        info!(%user_id, %challenge_id, kind = %verification.kind, "MFA challenge verified");

        Ok(verification)
    }

    /// Redeem a backup code without a challenge.
    ///
    /// The matching backup method is deleted; `InvalidCode` if none matches.
    pub async fn redeem_backup_code(&self, user_id: &str, code: &str) -> Result<Verification> {
        let _guard = self.ctx.locks.lock(user_id).await;

        let methods = self.ctx.store.list_methods(user_id).await?;
        let Some(method_id) = self.checker.find_backup(code, &methods).await? else {
            warn!(user_id, "Backup code redemption failed");
            self.ctx.audit(user_id, MfaEventType::VerifyFailed, None).await;
            return Err(MfaError::InvalidCode);
        };

        let method = methods
            .iter()
            .find(|m| m.id == method_id)
            .cloned()
            .ok_or_else(|| MfaError::NotFound(format!("method {}", method_id)))?;

        let changes = self.consume_backup(&method, None).await?;
        self.ctx.store.commit(changes).await?;
        self.ctx
            .audit(user_id, MfaEventType::BackupCodeUsed, Some(method_id))
            .await;
        info!(user_id, %method_id, "Backup code redeemed");

        Ok(Verification {
            user_id: user_id.to_string(),
            method_id,
            kind: MethodKind::Backup,
        })
    }

    /// Changes that destroy a used backup method
    async fn consume_backup(&self, method: &MfaMethod, keep: Option<Uuid>) -> Result<Vec<Change>> {
        let mut changes = vec![Change::DeleteMethod(method.id)];

        // Other challenges against this code can never succeed now
        for other in self.ctx.store.list_challenges(method.id).await? {
            if other.is_outstanding() && Some(other.id) != keep {
                changes.push(Change::DeleteChallenge(other.id));
            }
        }

        if method.is_primary {
            let remaining: Vec<MfaMethod> = self
                .ctx
                .store
                .list_methods(&method.user_id)
                .await?
                .into_iter()
                .filter(|m| m.id != method.id)
                .collect();
            if let Some(mut next) = successor_primary(&remaining) {
                next.is_primary = true;
                changes.push(Change::UpdateMethod(next));
                changes.push(Change::Require(Invariant::SinglePrimary(method.user_id.clone())));
            }
        }

        Ok(changes)
    }
}
