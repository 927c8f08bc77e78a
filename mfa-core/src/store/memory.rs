use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{is_purgeable, Change, MfaStore};
use crate::error::Result;
use crate::types::{MfaAuditEntry, MfaChallenge, MfaMethod};

#[derive(Debug, Default)]
struct Inner {
    methods: HashMap<Uuid, MfaMethod>,
    challenges: HashMap<Uuid, MfaChallenge>,
    audit: Vec<MfaAuditEntry>,
}

/// In-memory MFA store
///
/// Suitable for development and testing; records are lost on restart and not
/// shared across processes. A commit runs inside one write-lock critical
/// section, which makes it atomic for readers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit entries recorded for a user, oldest first
    pub async fn audit_log(&self, user_id: &str) -> Vec<MfaAuditEntry> {
        let inner = self.inner.read().await;
        inner
            .audit
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn challenge_count(&self) -> usize {
        self.inner.read().await.challenges.len()
    }
}

#[async_trait]
impl MfaStore for InMemoryStore {
    async fn get_method(&self, id: Uuid) -> Result<Option<MfaMethod>> {
        Ok(self.inner.read().await.methods.get(&id).cloned())
    }

    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethod>> {
        let inner = self.inner.read().await;
        let mut methods: Vec<MfaMethod> = inner
            .methods
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at).then(a.id.cmp(&b.id)));
        Ok(methods)
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<MfaChallenge>> {
        Ok(self.inner.read().await.challenges.get(&id).cloned())
    }

    async fn list_challenges(&self, method_id: Uuid) -> Result<Vec<MfaChallenge>> {
        let inner = self.inner.read().await;
        let mut challenges: Vec<MfaChallenge> = inner
            .challenges
            .values()
            .filter(|c| c.method_id == method_id)
            .cloned()
            .collect();
        challenges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(challenges)
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        let mut inner = self.inner.write().await;

        // Stage method writes so a failed requirement leaves nothing applied
        let mut methods = inner.methods.clone();
        let mut requirements = Vec::new();
        for change in &changes {
            match change {
                Change::PutMethod(method) => {
                    methods.insert(method.id, method.clone());
                }
                Change::UpdateMethod(method) => {
                    if let Some(slot) = methods.get_mut(&method.id) {
                        *slot = method.clone();
                    }
                }
                Change::DeleteMethod(id) => {
                    methods.remove(id);
                }
                Change::Require(invariant) => requirements.push(invariant),
                Change::PutChallenge(_) | Change::DeleteChallenge(_) => {}
            }
        }

        for invariant in requirements {
            let owned = methods.values().filter(|m| m.user_id == invariant.user_id());
            let (verified, primaries) = owned.fold((0, 0), |(v, p), m| {
                (v + usize::from(m.is_verified), p + usize::from(m.is_primary))
            });
            invariant.check(verified, primaries)?;
        }

        inner.methods = methods;
        for change in changes {
            match change {
                Change::PutChallenge(challenge) => {
                    inner.challenges.insert(challenge.id, challenge);
                }
                Change::DeleteChallenge(id) => {
                    inner.challenges.remove(&id);
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn purge_challenges(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let initial_len = inner.challenges.len();
        inner.challenges.retain(|_, c| !is_purgeable(c, before, now));
        Ok(initial_len - inner.challenges.len())
    }

    async fn record_event(&self, entry: &MfaAuditEntry) -> Result<()> {
        self.inner.write().await.audit.push(entry.clone());
        Ok(())
    }
}
