//! MFA service: wires the components around one store, clock and lock table

use std::sync::Arc;

use crate::backup::BackupCodeGenerator;
use crate::clock::{Clock, SystemClock};
use crate::codes::BackupCodeHasher;
use crate::config::MfaConfig;
use crate::context::MfaContext;
use crate::delivery::DeliveryChannel;
use crate::error::Result;
use crate::issuer::ChallengeIssuer;
use crate::locks::UserLocks;
use crate::registry::MethodRegistry;
use crate::store::MfaStore;
use crate::totp::{TotpProvider, TotpService};
use crate::types::MfaStatus;
use crate::verifier::{ChallengeVerifier, CodeChecker};

/// Entry point for multi-factor authentication
#[derive(Clone)]
pub struct MfaService {
    registry: MethodRegistry,
    issuer: ChallengeIssuer,
    verifier: ChallengeVerifier,
    backup_codes: BackupCodeGenerator,
    store: Arc<dyn MfaStore>,
}

impl MfaService {
    /// Create a service using the wall clock and `totp-rs`
    pub fn new(
        config: MfaConfig,
        store: Arc<dyn MfaStore>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Result<Self> {
        let totp = Arc::new(TotpService::with_config(config.totp.clone()));
        Self::with_components(config, store, channel, totp, Arc::new(SystemClock))
    }

    /// Create a service with every collaborator injected
    pub fn with_components(
        config: MfaConfig,
        store: Arc<dyn MfaStore>,
        channel: Arc<dyn DeliveryChannel>,
        totp: Arc<dyn TotpProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let hasher = BackupCodeHasher::new(&config.backup_codes)?;
        let checker = CodeChecker {
            totp,
            hasher: hasher.clone(),
            backup_length: config.backup_codes.length,
        };
        let ctx = MfaContext {
            store: Arc::clone(&store),
            clock,
            locks: Arc::new(UserLocks::new()),
            config: Arc::new(config),
        };

        Ok(Self {
            registry: MethodRegistry::new(ctx.clone(), checker.clone(), Arc::clone(&channel)),
            issuer: ChallengeIssuer::new(ctx.clone(), channel),
            verifier: ChallengeVerifier::new(ctx.clone(), checker),
            backup_codes: BackupCodeGenerator::new(ctx, hasher),
            store,
        })
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    pub fn issuer(&self) -> &ChallengeIssuer {
        &self.issuer
    }

    pub fn verifier(&self) -> &ChallengeVerifier {
        &self.verifier
    }

    pub fn backup_codes(&self) -> &BackupCodeGenerator {
        &self.backup_codes
    }

    /// Get MFA status for a user
    pub async fn status(&self, user_id: &str) -> Result<MfaStatus> {
        let methods = self.store.list_methods(user_id).await?;
        Ok(MfaStatus::from_methods(&methods))
    }

    /// Whether the user has a verified second factor
    pub async fn is_enabled(&self, user_id: &str) -> Result<bool> {
        Ok(self.status(user_id).await?.is_enabled)
    }
}
