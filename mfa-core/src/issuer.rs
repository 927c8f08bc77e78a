//! Challenge issuance and cancellation

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::codes::generate_numeric_code;
use crate::context::MfaContext;
use crate::delivery::DeliveryChannel;
use crate::error::{MfaError, Result};
use crate::store::Change;
use crate::types::{ChallengePurpose, ChallengeState, MethodKind, MfaChallenge, MfaEventType, MfaMethod};

/// What the caller learns about a freshly issued challenge.
///
/// The one-time code itself only travels through the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedChallenge {
    pub challenge_id: Uuid,
    pub method_id: Uuid,
    pub kind: MethodKind,
    pub expires_at: DateTime<Utc>,
}

/// Creates time-bounded challenges against verified methods
#[derive(Clone)]
pub struct ChallengeIssuer {
    ctx: MfaContext,
    channel: Arc<dyn DeliveryChannel>,
}

impl ChallengeIssuer {
    pub(crate) fn new(ctx: MfaContext, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { ctx, channel }
    }

    /// Issue a challenge against `method_id`, or the user's primary when `None`.
    ///
    /// Any challenge still outstanding for the same method is discarded in the
    /// same commit. For sms/email a fresh code is sent first; a delivery
    /// failure is returned and nothing is stored.
    pub async fn issue_challenge(&self, user_id: &str, method_id: Option<Uuid>) -> Result<IssuedChallenge> {
        let _guard = self.ctx.locks.lock(user_id).await;

        let method = self.resolve_method(user_id, method_id).await?;
        let now = self.ctx.clock.now();

        let code = method
            .kind
            .is_channel()
            .then(|| generate_numeric_code(self.ctx.config.challenge.code_length));
        let challenge = MfaChallenge::new(
            &method,
            ChallengePurpose::Authentication,
            code.clone(),
            now,
            self.ctx.config.challenge.ttl(),
        );

        let mut changes: Vec<Change> = self
            .ctx
            .store
            .list_challenges(method.id)
            .await?
            .into_iter()
            .filter(|c| c.is_outstanding())
            .map(|mut c| {
                debug!(challenge_id = %c.id, "Superseding outstanding challenge");
                c.state = ChallengeState::Discarded;
                Change::PutChallenge(c)
            })
            .collect();

        if let Some(code) = &code {
            let destination = method.destination.as_deref().ok_or_else(|| {
                MfaError::Unsupported(format!("{} method {} has no destination", method.kind, method.id))
            })?;
            self.channel.send(method.kind, destination, code).await?;
        }

        let issued = IssuedChallenge {
            challenge_id: challenge.id,
            method_id: method.id,
            kind: method.kind,
            expires_at: challenge.expires_at,
        };

        changes.push(Change::PutChallenge(challenge));
        self.ctx.store.commit(changes).await?;

        self.ctx
            .audit(user_id, MfaEventType::ChallengeIssued, Some(method.id))
            .await;
        info!(
            user_id,
            challenge_id = %issued.challenge_id,
            method_id = %issued.method_id,
            kind = %issued.kind,
            "MFA challenge issued"
        );

        Ok(issued)
    }

    /// Discard an outstanding challenge
    pub async fn cancel_challenge(&self, challenge_id: Uuid) -> Result<()> {
        let user_id = self.ctx.challenge(challenge_id).await?.user_id;
        let _guard = self.ctx.locks.lock(&user_id).await;

        let mut challenge = self.ctx.challenge(challenge_id).await?;
        if !challenge.is_outstanding() {
            return Err(MfaError::NotFound(format!("challenge {}", challenge_id)));
        }

        challenge.state = ChallengeState::Discarded;
        let method_id = challenge.method_id;
        self.ctx.store.put_challenge(challenge).await?;

        self.ctx
            .audit(&user_id, MfaEventType::ChallengeCancelled, Some(method_id))
            .await;
        debug!(%user_id, %challenge_id, "MFA challenge cancelled");

        Ok(())
    }

    /// Delete terminal or expired challenge records created before `older_than`
    pub async fn purge_stale_challenges(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .ctx
            .store
            .purge_challenges(older_than, self.ctx.clock.now())
            .await?;
        if removed > 0 {
            info!(removed, "Purged stale MFA challenges");
        }
        Ok(removed)
    }

    async fn resolve_method(&self, user_id: &str, method_id: Option<Uuid>) -> Result<MfaMethod> {
        match method_id {
            Some(id) => {
                let method = self
                    .ctx
                    .store
                    .get_method(id)
                    .await?
                    .filter(|m| m.user_id == user_id)
                    .ok_or_else(|| MfaError::NotFound(format!("method {} for user {}", id, user_id)))?;
                if !method.is_verified {
                    return Err(MfaError::Unverified(format!("method {}", id)));
                }
                Ok(method)
            }
            None => self
                .ctx
                .store
                .list_methods(user_id)
                .await?
                .into_iter()
                .find(|m| m.is_primary && m.is_verified)
                .ok_or_else(|| MfaError::NotFound(format!("no primary method for user {}", user_id))),
        }
    }
}
