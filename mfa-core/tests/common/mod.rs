//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use mfa_core::{
    Change, Clock, DeliveryChannel, InMemoryStore, ManualClock, MethodKind, MfaAuditEntry,
    MfaChallenge, MfaConfig, MfaError, MfaMethod, MfaService, MfaStore, RegisterOptions, Result,
    TotpService,
};
use uuid::Uuid;

/// One captured delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub kind: MethodKind,
    pub destination: String,
    pub code: String,
}

/// Channel that keeps every code it is asked to send
#[derive(Debug, Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<Delivery>>>,
}

impl RecordingChannel {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_code(&self) -> String {
        self.sent.lock().unwrap().last().expect("no delivery").code.clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn send(&self, kind: MethodKind, destination: &str, code: &str) -> Result<()> {
        self.sent.lock().unwrap().push(Delivery {
            kind,
            destination: destination.to_string(),
            code: code.to_string(),
        });
        Ok(())
    }
}

/// Channel whose transport is always down
#[derive(Debug, Clone, Default)]
pub struct FailingChannel;

#[async_trait]
impl DeliveryChannel for FailingChannel {
    async fn send(&self, _kind: MethodKind, _destination: &str, _code: &str) -> Result<()> {
        Err(MfaError::Delivery("gateway unavailable".to_string()))
    }
}

/// Store whose method listings lag, widening the window between an
/// operation's checks and its commit
pub struct LaggingStore {
    inner: Arc<dyn MfaStore>,
    lag: std::time::Duration,
}

impl LaggingStore {
    pub fn new(inner: Arc<dyn MfaStore>, lag: std::time::Duration) -> Self {
        Self { inner, lag }
    }
}

#[async_trait]
impl MfaStore for LaggingStore {
    async fn get_method(&self, id: Uuid) -> Result<Option<MfaMethod>> {
        self.inner.get_method(id).await
    }

    async fn list_methods(&self, user_id: &str) -> Result<Vec<MfaMethod>> {
        let methods = self.inner.list_methods(user_id).await?;
        tokio::time::sleep(self.lag).await;
        Ok(methods)
    }

    async fn get_challenge(&self, id: Uuid) -> Result<Option<MfaChallenge>> {
        self.inner.get_challenge(id).await
    }

    async fn list_challenges(&self, method_id: Uuid) -> Result<Vec<MfaChallenge>> {
        self.inner.list_challenges(method_id).await
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        self.inner.commit(changes).await
    }

    async fn purge_challenges(&self, before: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_challenges(before, now).await
    }

    async fn record_event(&self, entry: &MfaAuditEntry) -> Result<()> {
        self.inner.record_event(entry).await
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

/// Config with cheap Argon2 parameters so hashing does not dominate test time
pub fn test_config() -> MfaConfig {
    let mut config = MfaConfig::default();
    config.backup_codes.memory_kib = 64;
    config.backup_codes.iterations = 1;
    config.backup_codes.parallelism = 1;
    config
}

pub struct Harness {
    pub service: MfaService,
    pub clock: ManualClock,
    pub channel: RecordingChannel,
    pub totp: TotpService,
}

impl Harness {
    pub fn in_memory() -> (Self, InMemoryStore) {
        let store = InMemoryStore::new();
        let harness = Self::with_store(Arc::new(store.clone()));
        (harness, store)
    }

    pub fn with_store(store: Arc<dyn MfaStore>) -> Self {
        let config = test_config();
        let clock = ManualClock::new(start_time());
        let channel = RecordingChannel::default();
        let totp = TotpService::with_config(config.totp.clone());

        let service = MfaService::with_components(
            config,
            store,
            Arc::new(channel.clone()),
            Arc::new(totp.clone()),
            Arc::new(clock.clone()),
        )
        .unwrap();

        Self {
            service,
            clock,
            channel,
            totp,
        }
    }

    /// Register and confirm a TOTP method, returning its id and secret
    pub async fn enroll_totp(&self, user_id: &str) -> (Uuid, String) {
        let registration = self
            .service
            .registry()
            .register_method(user_id, MethodKind::Totp, RegisterOptions::default())
            .await
            .unwrap();
        let secret = registration.totp.unwrap().secret;
        let code = self.totp_code(&secret);

        self.service
            .registry()
            .confirm_enrollment(registration.method.id, &code)
            .await
            .unwrap();

        (registration.method.id, secret)
    }

    /// Register and confirm a channel method using the delivered code
    pub async fn enroll_channel(&self, user_id: &str, kind: MethodKind, destination: &str) -> Uuid {
        let registration = self
            .service
            .registry()
            .register_method(user_id, kind, RegisterOptions::with_destination(destination))
            .await
            .unwrap();

        self.service
            .registry()
            .confirm_enrollment(registration.method.id, &self.channel.last_code())
            .await
            .unwrap();

        registration.method.id
    }

    pub fn totp_code(&self, secret: &str) -> String {
        self.totp.generate_at(secret, self.clock.now()).unwrap()
    }
}

/// A numeric code of the same length that differs from `code`
pub fn wrong_code(code: &str) -> String {
    code.chars()
        .map(|c| match c {
            '9' => '0',
            c => char::from(c as u8 + 1),
        })
        .collect()
}
