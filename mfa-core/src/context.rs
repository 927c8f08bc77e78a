//! State shared by the registry, issuer, verifier and backup generator

use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MfaConfig;
use crate::error::{MfaError, Result};
use crate::locks::UserLocks;
use crate::store::MfaStore;
use crate::types::{MfaAuditEntry, MfaChallenge, MfaEventType, MfaMethod};

#[derive(Clone)]
pub(crate) struct MfaContext {
    pub store: Arc<dyn MfaStore>,
    pub clock: Arc<dyn Clock>,
    pub locks: Arc<UserLocks>,
    pub config: Arc<MfaConfig>,
}

impl MfaContext {
    /// Load a method or fail with `NotFound`
    pub async fn method(&self, id: Uuid) -> Result<MfaMethod> {
        self.store
            .get_method(id)
            .await?
            .ok_or_else(|| MfaError::NotFound(format!("method {}", id)))
    }

    /// Load a challenge or fail with `NotFound`
    pub async fn challenge(&self, id: Uuid) -> Result<MfaChallenge> {
        self.store
            .get_challenge(id)
            .await?
            .ok_or_else(|| MfaError::NotFound(format!("challenge {}", id)))
    }

    /// Record an audit event; failures are logged, never returned
    pub async fn audit(&self, user_id: &str, event_type: MfaEventType, method_id: Option<Uuid>) {
        let entry = MfaAuditEntry::new(user_id, event_type, method_id, self.clock.now());
        if let Err(e) = self.store.record_event(&entry).await {
            warn!(user_id, event = %event_type, error = %e, "Failed to record MFA audit event");
        }
    }
}
