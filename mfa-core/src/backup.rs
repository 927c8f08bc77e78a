//! Backup codes for account recovery.

use std::collections::HashSet;
use tracing::info;

use crate::codes::{generate_backup_code, BackupCodeHasher};
use crate::context::MfaContext;
use crate::error::{MfaError, Result};
use crate::registry::successor_primary;
use crate::store::{Change, Invariant};
use crate::types::{MethodKind, MfaEventType, MfaMethod};

/// A freshly minted set of backup codes.
///
/// Only the hashes are stored, so this is the one chance to show the codes.
#[derive(Clone, Debug)]
pub struct BackupCodes {
    pub codes: Vec<String>,
}

impl BackupCodes {
    /// Format codes for display to user (grouped for readability).
    pub fn display_codes(&self) -> Vec<String> {
        self.codes
            .iter()
            .map(|c| {
                if c.len() >= 8 {
                    let (head, tail) = c.split_at(c.len() / 2);
                    format!("{}-{}", head, tail)
                } else {
                    c.clone()
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Mints pre-verified, single-use backup methods
#[derive(Clone)]
pub struct BackupCodeGenerator {
    ctx: MfaContext,
    hasher: BackupCodeHasher,
}

impl BackupCodeGenerator {
    pub(crate) fn new(ctx: MfaContext, hasher: BackupCodeHasher) -> Self {
        Self { ctx, hasher }
    }

    /// Generate new backup codes for a user, `backup_codes.count` of them
    /// unless `count` says otherwise.
    ///
    /// Each code becomes a verified, non-primary backup method.
    pub async fn generate_backup_codes(&self, user_id: &str, count: Option<usize>) -> Result<BackupCodes> {
        let count = self.resolve_count(count);
        let _guard = self.ctx.locks.lock(user_id).await;
        self.mint(user_id, count, Vec::new()).await
    }

    /// Replace all of a user's backup codes with a fresh set
    pub async fn regenerate_backup_codes(&self, user_id: &str, count: Option<usize>) -> Result<BackupCodes> {
        let count = self.resolve_count(count);
        let _guard = self.ctx.locks.lock(user_id).await;

        let methods = self.ctx.store.list_methods(user_id).await?;
        let (old, kept): (Vec<MfaMethod>, Vec<MfaMethod>) = methods
            .into_iter()
            .partition(|m| m.kind == MethodKind::Backup);

        if count == 0 && !old.is_empty() && !kept.iter().any(|m| m.is_verified) {
            return Err(MfaError::InvariantViolation(format!(
                "removing all backup codes would leave user {} without a verified method",
                user_id
            )));
        }

        let mut changes: Vec<Change> = old.iter().map(|m| Change::DeleteMethod(m.id)).collect();
        for method in &old {
            for challenge in self.ctx.store.list_challenges(method.id).await? {
                changes.push(Change::DeleteChallenge(challenge.id));
            }
        }

        if !old.is_empty() {
            changes.push(Change::Require(Invariant::HasVerifiedMethod(user_id.to_string())));
        }
        if old.iter().any(|m| m.is_primary) {
            if let Some(mut next) = successor_primary(&kept) {
                next.is_primary = true;
                changes.push(Change::UpdateMethod(next));
                changes.push(Change::Require(Invariant::SinglePrimary(user_id.to_string())));
            }
        }

        self.mint(user_id, count, changes).await
    }

    /// Number of unused backup codes
    pub async fn remaining_backup_codes(&self, user_id: &str) -> Result<usize> {
        Ok(self
            .ctx
            .store
            .list_methods(user_id)
            .await?
            .iter()
            .filter(|m| m.kind == MethodKind::Backup)
            .count())
    }

    fn resolve_count(&self, count: Option<usize>) -> usize {
        count.unwrap_or(self.ctx.config.backup_codes.count)
    }

    async fn mint(&self, user_id: &str, count: usize, mut changes: Vec<Change>) -> Result<BackupCodes> {
        let length = self.ctx.config.backup_codes.length;

        let mut seen = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);
        while codes.len() < count {
            let code = generate_backup_code(length);
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        let hasher = self.hasher.clone();
        let to_hash = codes.clone();
        let hashes = tokio::task::spawn_blocking(move || {
            to_hash
                .iter()
                .map(|c| hasher.hash(c))
                .collect::<Result<Vec<String>>>()
        })
        .await
        .map_err(|e| MfaError::Crypto(format!("hash task failed: {}", e)))??;

        let now = self.ctx.clock.now();
        for hash in hashes {
            let mut method = MfaMethod::new(user_id, MethodKind::Backup, Some(hash), None, now);
            method.is_verified = true;
            changes.push(Change::PutMethod(method));
        }

        self.ctx.store.commit(changes).await?;

        self.ctx
            .audit(user_id, MfaEventType::BackupCodesGenerated, None)
            .await;
        info!(user_id, count, "Backup codes generated");

        Ok(BackupCodes { codes })
    }
}
