//! Method registry: enrollment, confirmation, primary selection, removal
//!
//! # Invariants
//! - at most one primary method per user
//! - a primary method is always verified
//! - removing a user's last verified method is rejected
//!
//! All mutations for a user run under that user's guard and write through a
//! single store commit.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codes::generate_numeric_code;
use crate::context::MfaContext;
use crate::delivery::DeliveryChannel;
use crate::error::{MfaError, Result};
use crate::store::{Change, Invariant};
use crate::types::{
    ChallengePurpose, ChallengeState, MethodKind, MfaChallenge, MfaEventType, MfaMethod,
    RegisterOptions, Registration,
};
use crate::verifier::CodeChecker;

/// Owns the set of enrolled methods per user
#[derive(Clone)]
pub struct MethodRegistry {
    ctx: MfaContext,
    checker: CodeChecker,
    channel: Arc<dyn DeliveryChannel>,
}

impl MethodRegistry {
    pub(crate) fn new(ctx: MfaContext, checker: CodeChecker, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self {
            ctx,
            checker,
            channel,
        }
    }

    /// Create an unverified method.
    ///
    /// TOTP registrations return the generated secret and provisioning
    /// payload. SMS/email registrations send an enrollment code and return the
    /// id of the challenge holding it; if delivery fails nothing is stored.
    pub async fn register_method(
        &self,
        user_id: &str,
        kind: MethodKind,
        options: RegisterOptions,
    ) -> Result<Registration> {
        let destination = match kind {
            MethodKind::Backup => {
                return Err(MfaError::Unsupported(
                    "backup methods are created by backup code generation".to_string(),
                ))
            }
            MethodKind::Sms | MethodKind::Email => {
                let destination = options
                    .destination
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .ok_or_else(|| {
                        MfaError::Unsupported(format!("{} method requires a destination", kind))
                    })?;
                Some(destination.to_string())
            }
            MethodKind::Totp => None,
        };

        let _guard = self.ctx.locks.lock(user_id).await;
        let now = self.ctx.clock.now();

        let registration = match kind {
            MethodKind::Totp => {
                let account_name = options.account_name.as_deref().unwrap_or(user_id);
                let enrollment = self.checker.totp.generate_secret(account_name)?;
                let method = MfaMethod::new(user_id, kind, Some(enrollment.secret.clone()), None, now);

                self.ctx.store.put_method(method.clone()).await?;

                Registration {
                    method,
                    totp: Some(enrollment),
                    enrollment_challenge_id: None,
                }
            }
            _ => {
                let method = MfaMethod::new(user_id, kind, None, destination, now);
                let code = generate_numeric_code(self.ctx.config.challenge.code_length);
                let challenge = MfaChallenge::new(
                    &method,
                    ChallengePurpose::Enrollment,
                    Some(code.clone()),
                    now,
                    self.ctx.config.challenge.ttl(),
                );
                let challenge_id = challenge.id;

                let destination = method.destination.as_deref().unwrap_or_default();
                self.channel.send(kind, destination, &code).await?;

                self.ctx
                    .store
                    .commit(vec![Change::PutMethod(method.clone()), Change::PutChallenge(challenge)])
                    .await?;

                Registration {
                    method,
                    totp: None,
                    enrollment_challenge_id: Some(challenge_id),
                }
            }
        };

        self.ctx
            .audit(user_id, MfaEventType::MethodRegistered, Some(registration.method.id))
            .await;
        info!(user_id, method_id = %registration.method.id, %kind, "MFA method registered");

        Ok(registration)
    }

    /// Confirm a registered method with its first code.
    ///
    /// Marks the method verified and promotes it to primary when the user has
    /// no primary yet. Confirming an already verified method is a no-op.
    pub async fn confirm_enrollment(&self, method_id: Uuid, code: &str) -> Result<MfaMethod> {
        let user_id = self.ctx.method(method_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        let mut method = self.ctx.method(method_id).await?;
        if method.is_verified {
            return Ok(method);
        }

        let now = self.ctx.clock.now();
        let mut changes = Vec::new();

        match method.kind {
            MethodKind::Totp => {
                self.check_enrollment_code(&method, None, code, now).await?;
            }
            MethodKind::Sms | MethodKind::Email => {
                let mut challenge = self
                    .ctx
                    .store
                    .list_challenges(method.id)
                    .await?
                    .into_iter()
                    .filter(|c| c.is_outstanding() && c.purpose == ChallengePurpose::Enrollment)
                    .last()
                    .ok_or_else(|| {
                        MfaError::NotFound(format!("no outstanding enrollment code for method {}", method_id))
                    })?;

                if challenge.is_expired_at(now) {
                    challenge.state = ChallengeState::Discarded;
                    self.ctx.store.put_challenge(challenge).await?;
                    return Err(MfaError::Expired);
                }

                self.check_enrollment_code(&method, Some(&challenge), code, now)
                    .await?;
                challenge.state = ChallengeState::Consumed;
                changes.push(Change::PutChallenge(challenge));
            }
            MethodKind::Backup => {
                return Err(MfaError::Unsupported(
                    "backup methods need no confirmation".to_string(),
                ))
            }
        }

        let has_primary = self
            .ctx
            .store
            .list_methods(&user_id)
            .await?
            .iter()
            .any(|m| m.is_primary);

        method.is_verified = true;
        method.is_primary = !has_primary;
        changes.push(Change::UpdateMethod(method.clone()));
        if method.is_primary {
            changes.push(Change::Require(Invariant::SinglePrimary(user_id.clone())));
        }
        self.ctx.store.commit(changes).await?;

        self.ctx
            .audit(&user_id, MfaEventType::EnrollmentConfirmed, Some(method_id))
            .await;
        info!(%user_id, %method_id, primary = method.is_primary, "MFA enrollment confirmed");

        Ok(method)
    }

    /// Send a fresh enrollment code for an unverified sms/email method.
    ///
    /// Outstanding enrollment codes for the method are discarded in the same
    /// commit, so only the newest code confirms. Returns the id of the new
    /// enrollment challenge.
    pub async fn resend_enrollment_code(&self, method_id: Uuid) -> Result<Uuid> {
        let user_id = self.ctx.method(method_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        let method = self.ctx.method(method_id).await?;
        if !method.kind.is_channel() {
            return Err(MfaError::Unsupported(format!(
                "{} methods have no enrollment code to resend",
                method.kind
            )));
        }
        if method.is_verified {
            return Err(MfaError::NotFound(format!(
                "no pending enrollment for method {}",
                method_id
            )));
        }

        let now = self.ctx.clock.now();
        let code = generate_numeric_code(self.ctx.config.challenge.code_length);
        let challenge = MfaChallenge::new(
            &method,
            ChallengePurpose::Enrollment,
            Some(code.clone()),
            now,
            self.ctx.config.challenge.ttl(),
        );
        let challenge_id = challenge.id;

        let mut changes: Vec<Change> = self
            .ctx
            .store
            .list_challenges(method_id)
            .await?
            .into_iter()
            .filter(|c| c.is_outstanding())
            .map(|mut c| {
                c.state = ChallengeState::Discarded;
                Change::PutChallenge(c)
            })
            .collect();
        changes.push(Change::PutChallenge(challenge));

        let destination = method.destination.as_deref().unwrap_or_default();
        self.channel.send(method.kind, destination, &code).await?;
        self.ctx.store.commit(changes).await?;

        debug!(%user_id, %method_id, %challenge_id, "Enrollment code resent");
        Ok(challenge_id)
    }

    /// Make a verified method the user's primary, demoting the current one
    pub async fn set_primary_method(&self, method_id: Uuid) -> Result<MfaMethod> {
        let user_id = self.ctx.method(method_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        let mut target = self.ctx.method(method_id).await?;
        if !target.is_verified {
            return Err(MfaError::Unverified(format!("method {}", method_id)));
        }
        if target.is_primary {
            return Ok(target);
        }

        let mut changes: Vec<Change> = self
            .ctx
            .store
            .list_methods(&user_id)
            .await?
            .into_iter()
            .filter(|m| m.is_primary && m.id != method_id)
            .map(|mut m| {
                m.is_primary = false;
                Change::UpdateMethod(m)
            })
            .collect();

        target.is_primary = true;
        changes.push(Change::UpdateMethod(target.clone()));
        changes.push(Change::Require(Invariant::SinglePrimary(user_id.clone())));
        self.ctx.store.commit(changes).await?;

        self.ctx
            .audit(&user_id, MfaEventType::PrimaryChanged, Some(method_id))
            .await;
        info!(%user_id, %method_id, "Primary MFA method changed");

        Ok(target)
    }

    /// Delete a method and its challenges.
    ///
    /// Fails with `InvariantViolation` when it is the user's only verified
    /// method. Removing the primary promotes the earliest-enrolled remaining
    /// verified non-backup method, if any.
    pub async fn remove_method(&self, method_id: Uuid) -> Result<()> {
        let user_id = self.ctx.method(method_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        let method = self.ctx.method(method_id).await?;
        let methods = self.ctx.store.list_methods(&user_id).await?;

        let verified = methods.iter().filter(|m| m.is_verified).count();
        if method.is_verified && verified == 1 {
            warn!(%user_id, %method_id, "Refusing to remove last verified MFA method");
            return Err(MfaError::InvariantViolation(format!(
                "method {} is the last verified method of user {}",
                method_id, user_id
            )));
        }

        let mut changes = vec![Change::DeleteMethod(method_id)];
        for challenge in self.ctx.store.list_challenges(method_id).await? {
            changes.push(Change::DeleteChallenge(challenge.id));
        }
        // Another process may have removed a method since the count above
        if method.is_verified {
            changes.push(Change::Require(Invariant::HasVerifiedMethod(user_id.clone())));
        }

        if method.is_primary {
            let remaining: Vec<MfaMethod> =
                methods.into_iter().filter(|m| m.id != method_id).collect();
            match successor_primary(&remaining) {
                Some(mut next) => {
                    debug!(%user_id, method_id = %next.id, "Promoting successor primary");
                    next.is_primary = true;
                    changes.push(Change::UpdateMethod(next));
                    changes.push(Change::Require(Invariant::SinglePrimary(user_id.clone())));
                }
                None => debug!(%user_id, "User left without a primary method"),
            }
        }

        self.ctx.store.commit(changes).await?;

        self.ctx
            .audit(&user_id, MfaEventType::MethodRemoved, Some(method_id))
            .await;
        info!(%user_id, %method_id, kind = %method.kind, "MFA method removed");

        Ok(())
    }

    /// All methods of a user
    pub async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethod>> {
        self.ctx.store.list_methods(user_id).await
    }

    pub async fn get_method(&self, method_id: Uuid) -> Result<MfaMethod> {
        self.ctx.method(method_id).await
    }

    async fn check_enrollment_code(
        &self,
        method: &MfaMethod,
        challenge: Option<&MfaChallenge>,
        code: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let result = self.checker.check(method, challenge, code, now).await;
        if matches!(result, Err(MfaError::InvalidCode)) {
            self.ctx
                .audit(&method.user_id, MfaEventType::VerifyFailed, Some(method.id))
                .await;
        }
        result
    }
}

/// Method to promote when the primary goes away: the earliest-enrolled
/// verified method that is not a backup code
pub(crate) fn successor_primary(remaining: &[MfaMethod]) -> Option<MfaMethod> {
    remaining
        .iter()
        .filter(|m| m.is_verified && m.kind != MethodKind::Backup)
        .min_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at).then(a.id.cmp(&b.id)))
        .cloned()
}
