//! Persistence for methods and challenges
//!
//! Reads go through individual lookups. Writes are batched into a list of
//! [`Change`]s and applied by [`MfaStore::commit`] as one atomic unit, so a
//! failed operation never leaves a partial mutation behind.
//!
//! The per-user guards only serialize callers inside one process. Several
//! services (or an `mfa-admin` run) may share a database, so every commit
//! that could break a per-user invariant carries a [`Change::Require`] that
//! the store re-checks against the post-commit state before making it
//! visible.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{MfaError, Result};
use crate::types::{MfaAuditEntry, MfaChallenge, MfaMethod};

/// A single write inside a commit
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Insert or replace a method
    PutMethod(MfaMethod),
    /// Replace a method that still exists; skipped when it is gone
    UpdateMethod(MfaMethod),
    DeleteMethod(Uuid),
    /// Insert or replace a challenge
    PutChallenge(MfaChallenge),
    DeleteChallenge(Uuid),
    /// Abort the whole commit with `InvariantViolation` unless this holds
    /// once the other changes are applied
    Require(Invariant),
}

/// Per-user condition checked inside a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invariant {
    /// The user keeps at least one verified method
    HasVerifiedMethod(String),
    /// The user has at most one primary method
    SinglePrimary(String),
}

impl Invariant {
    pub fn user_id(&self) -> &str {
        match self {
            Self::HasVerifiedMethod(user_id) | Self::SinglePrimary(user_id) => user_id,
        }
    }

    /// Evaluate against the user's verified and primary method counts
    pub(crate) fn check(&self, verified: usize, primaries: usize) -> Result<()> {
        match self {
            Self::HasVerifiedMethod(user_id) if verified == 0 => Err(MfaError::InvariantViolation(
                format!("user {} would be left without a verified method", user_id),
            )),
            Self::SinglePrimary(user_id) if primaries > 1 => Err(MfaError::InvariantViolation(
                format!("user {} would have {} primary methods", user_id, primaries),
            )),
            _ => Ok(()),
        }
    }
}

/// Storage backend for MFA records.
///
/// Implementations must apply each `commit` all-or-nothing. Per-user
/// serialization is provided by the caller.
#[async_trait]
pub trait MfaStore: Send + Sync {
    async fn get_method(&self, id: Uuid) -> Result<Option<MfaMethod>>;

    /// All methods of a user, ordered by enrollment time then id
    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethod>>;

    async fn get_challenge(&self, id: Uuid) -> Result<Option<MfaChallenge>>;

    /// All challenges targeting a method, oldest first
    async fn list_challenges(&self, method_id: Uuid) -> Result<Vec<MfaChallenge>>;

    /// Apply a batch of changes atomically.
    ///
    /// `Require` entries are evaluated after the writes, inside the same
    /// atomic unit; a failing one rolls everything back.
    async fn commit(&self, changes: Vec<Change>) -> Result<()>;

    /// Delete challenges created before `before` that are terminal or expired
    /// at `now`. Returns the number removed.
    async fn purge_challenges(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize>;

    /// Append an audit entry
    async fn record_event(&self, entry: &MfaAuditEntry) -> Result<()>;

    async fn put_method(&self, method: MfaMethod) -> Result<()> {
        self.commit(vec![Change::PutMethod(method)]).await
    }

    async fn put_challenge(&self, challenge: MfaChallenge) -> Result<()> {
        self.commit(vec![Change::PutChallenge(challenge)]).await
    }

    async fn delete_method(&self, id: Uuid) -> Result<()> {
        self.commit(vec![Change::DeleteMethod(id)]).await
    }
}

/// Whether a challenge may be dropped by a purge
pub(crate) fn is_purgeable(challenge: &MfaChallenge, before: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    challenge.created_at < before && (!challenge.is_outstanding() || challenge.is_expired_at(now))
}
