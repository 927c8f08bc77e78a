//! Integration tests for the MFA enrollment and challenge flows

mod common;

use chrono::Duration;
use common::{wrong_code, FailingChannel, Harness, LaggingStore};
use mfa_core::{
    ChallengeState, Clock, InMemoryStore, ManualClock, MethodKind, MfaError, MfaEventType,
    MfaService, MfaStore, RegisterOptions, SqliteStore, TotpService,
};
use std::sync::Arc;

#[tokio::test]
async fn test_totp_enrollment_and_login() {
    let (h, _) = Harness::in_memory();

    let registration = h
        .service
        .registry()
        .register_method("alice", MethodKind::Totp, RegisterOptions::default())
        .await
        .unwrap();
    assert!(!registration.method.is_verified);
    assert!(!registration.method.is_primary);

    let enrollment = registration.totp.unwrap();
    assert!(enrollment.provisioning_uri.starts_with("otpauth://totp/"));

    let method = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &h.totp_code(&enrollment.secret))
        .await
        .unwrap();
    assert!(method.is_verified);
    assert!(method.is_primary);

    let issued = h.service.issuer().issue_challenge("alice", None).await.unwrap();
    assert_eq!(issued.method_id, method.id);
    assert_eq!(issued.kind, MethodKind::Totp);
    // No code leaves the service for totp
    assert!(h.channel.deliveries().is_empty());

    let code = h.totp_code(&enrollment.secret);
    let result = h
        .service
        .verifier()
        .verify_challenge(issued.challenge_id, &wrong_code(&code))
        .await;
    assert!(matches!(result, Err(MfaError::InvalidCode)));

    // Still usable after a wrong code
    let verification = h
        .service
        .verifier()
        .verify_challenge(issued.challenge_id, &code)
        .await
        .unwrap();
    assert_eq!(verification.user_id, "alice");
    assert_eq!(verification.method_id, method.id);

    let stored = h.service.registry().get_method(method.id).await.unwrap();
    assert_eq!(stored.last_used_at, Some(h.clock.now()));
}

#[tokio::test]
async fn test_totp_confirmation_rejects_wrong_code() {
    let (h, _) = Harness::in_memory();

    let registration = h
        .service
        .registry()
        .register_method("alice", MethodKind::Totp, RegisterOptions::default())
        .await
        .unwrap();
    let secret = registration.totp.unwrap().secret;

    let result = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &wrong_code(&h.totp_code(&secret)))
        .await;
    assert!(matches!(result, Err(MfaError::InvalidCode)));

    let method = h.service.registry().get_method(registration.method.id).await.unwrap();
    assert!(!method.is_verified);
    assert!(!method.is_primary);
}

#[tokio::test]
async fn test_totp_previous_step_code_rejected() {
    let (h, _) = Harness::in_memory();
    let (_, secret) = h.enroll_totp("alice").await;

    let issued = h.service.issuer().issue_challenge("alice", None).await.unwrap();
    let stale = h.totp_code(&secret);
    h.clock.advance(Duration::seconds(30));

    let result = h
        .service
        .verifier()
        .verify_challenge(issued.challenge_id, &stale)
        .await;
    assert!(matches!(result, Err(MfaError::InvalidCode)));
}

#[tokio::test]
async fn test_sms_code_is_single_use() {
    let (h, _) = Harness::in_memory();
    let method_id = h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    assert_eq!(issued.method_id, method_id);

    let delivery = h.channel.deliveries().pop().unwrap();
    assert_eq!(delivery.kind, MethodKind::Sms);
    assert_eq!(delivery.destination, "+15550001");
    assert_eq!(delivery.code.len(), 6);
    assert!(delivery.code.chars().all(|c| c.is_ascii_digit()));

    h.service
        .verifier()
        .verify_challenge(issued.challenge_id, &delivery.code)
        .await
        .unwrap();

    let result = h
        .service
        .verifier()
        .verify_challenge(issued.challenge_id, &delivery.code)
        .await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));
}

#[tokio::test]
async fn test_email_enrollment_code_cannot_answer_login() {
    let (h, _) = Harness::in_memory();

    let registration = h
        .service
        .registry()
        .register_method(
            "carol",
            MethodKind::Email,
            RegisterOptions::with_destination("carol@example.com"),
        )
        .await
        .unwrap();
    let enrollment_id = registration.enrollment_challenge_id.unwrap();

    let result = h
        .service
        .verifier()
        .verify_challenge(enrollment_id, &h.channel.last_code())
        .await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));

    let method = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &h.channel.last_code())
        .await
        .unwrap();
    assert!(method.is_verified);
    assert!(method.is_primary);
}

#[tokio::test]
async fn test_expired_enrollment_code() {
    let (h, _) = Harness::in_memory();

    let registration = h
        .service
        .registry()
        .register_method("bob", MethodKind::Sms, RegisterOptions::with_destination("+15550001"))
        .await
        .unwrap();
    h.clock.advance(Duration::minutes(6));

    let result = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &h.channel.last_code())
        .await;
    assert!(matches!(result, Err(MfaError::Expired)));

    // The expired code is gone, not merely rejected
    let result = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &h.channel.last_code())
        .await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));
}

#[tokio::test]
async fn test_remove_primary_with_backup_remaining() {
    let (h, _) = Harness::in_memory();
    let sms = h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;
    h.service.backup_codes().generate_backup_codes("bob", Some(1)).await.unwrap();

    h.service.registry().remove_method(sms).await.unwrap();

    let methods = h.service.registry().list_methods("bob").await.unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].kind, MethodKind::Backup);
    // Backup codes are never promoted
    assert!(!methods[0].is_primary);
    assert!(h.service.is_enabled("bob").await.unwrap());
}

#[tokio::test]
async fn test_remove_primary_promotes_earliest_enrolled() {
    let (h, _) = Harness::in_memory();
    let (totp, _) = h.enroll_totp("alice").await;
    h.clock.advance(Duration::seconds(1));
    let sms = h.enroll_channel("alice", MethodKind::Sms, "+15550002").await;
    h.clock.advance(Duration::seconds(1));
    let email = h.enroll_channel("alice", MethodKind::Email, "alice@example.com").await;

    h.service.registry().set_primary_method(email).await.unwrap();
    h.service.registry().remove_method(email).await.unwrap();

    let primary: Vec<_> = h
        .service
        .registry()
        .list_methods("alice")
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.is_primary)
        .map(|m| m.id)
        .collect();
    assert_eq!(primary, vec![totp]);
    assert_ne!(primary[0], sms);
}

#[tokio::test]
async fn test_remove_last_verified_method_rejected() {
    let (h, _) = Harness::in_memory();
    let (totp, _) = h.enroll_totp("alice").await;

    let result = h.service.registry().remove_method(totp).await;
    assert!(matches!(result, Err(MfaError::InvariantViolation(_))));

    let methods = h.service.registry().list_methods("alice").await.unwrap();
    assert_eq!(methods.len(), 1);
    assert!(methods[0].is_primary);
}

#[tokio::test]
async fn test_remove_unverified_method_allowed() {
    let (h, _) = Harness::in_memory();
    let registration = h
        .service
        .registry()
        .register_method("alice", MethodKind::Totp, RegisterOptions::default())
        .await
        .unwrap();

    h.service.registry().remove_method(registration.method.id).await.unwrap();
    assert!(h.service.registry().list_methods("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reissue_invalidates_previous_challenge() {
    let (h, _) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let first = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    let first_code = h.channel.last_code();
    let second = h.service.issuer().issue_challenge("bob", None).await.unwrap();

    let result = h
        .service
        .verifier()
        .verify_challenge(first.challenge_id, &first_code)
        .await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));

    h.service
        .verifier()
        .verify_challenge(second.challenge_id, &h.channel.last_code())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_challenge_rejects_correct_code() {
    let (h, store) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    let code = h.channel.last_code();
    h.clock.advance(Duration::minutes(5) + Duration::seconds(1));

    let result = h.service.verifier().verify_challenge(issued.challenge_id, &code).await;
    assert!(matches!(result, Err(MfaError::Expired)));

    let stored = store.get_challenge(issued.challenge_id).await.unwrap().unwrap();
    assert_eq!(stored.state, ChallengeState::Discarded);
}

#[tokio::test]
async fn test_challenge_valid_at_exact_expiry() {
    let (h, _) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    h.clock.set(issued.expires_at);

    h.service
        .verifier()
        .verify_challenge(issued.challenge_id, &h.channel.last_code())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_issue_without_verified_method() {
    let (h, _) = Harness::in_memory();

    let result = h.service.issuer().issue_challenge("nobody", None).await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));
}

#[tokio::test]
async fn test_issue_against_unverified_method() {
    let (h, _) = Harness::in_memory();
    h.enroll_totp("alice").await;
    let pending = h
        .service
        .registry()
        .register_method("alice", MethodKind::Sms, RegisterOptions::with_destination("+15550003"))
        .await
        .unwrap();

    let result = h
        .service
        .issuer()
        .issue_challenge("alice", Some(pending.method.id))
        .await;
    assert!(matches!(result, Err(MfaError::Unverified(_))));
}

#[tokio::test]
async fn test_set_primary_requires_verification() {
    let (h, _) = Harness::in_memory();
    let (totp, _) = h.enroll_totp("alice").await;
    let pending = h
        .service
        .registry()
        .register_method("alice", MethodKind::Sms, RegisterOptions::with_destination("+15550003"))
        .await
        .unwrap();

    let result = h.service.registry().set_primary_method(pending.method.id).await;
    assert!(matches!(result, Err(MfaError::Unverified(_))));
    assert!(h.service.registry().get_method(totp).await.unwrap().is_primary);
}

#[tokio::test]
async fn test_set_primary_demotes_previous() {
    let (h, _) = Harness::in_memory();
    let (totp, _) = h.enroll_totp("alice").await;
    let sms = h.enroll_channel("alice", MethodKind::Sms, "+15550002").await;
    assert!(!h.service.registry().get_method(sms).await.unwrap().is_primary);

    h.service.registry().set_primary_method(sms).await.unwrap();

    assert!(h.service.registry().get_method(sms).await.unwrap().is_primary);
    assert!(!h.service.registry().get_method(totp).await.unwrap().is_primary);
}

#[tokio::test]
async fn test_channel_registration_requires_destination() {
    let (h, _) = Harness::in_memory();

    let result = h
        .service
        .registry()
        .register_method("alice", MethodKind::Sms, RegisterOptions::default())
        .await;
    assert!(matches!(result, Err(MfaError::Unsupported(_))));

    let result = h
        .service
        .registry()
        .register_method("alice", MethodKind::Email, RegisterOptions::with_destination("   "))
        .await;
    assert!(matches!(result, Err(MfaError::Unsupported(_))));

    let result = h
        .service
        .registry()
        .register_method("alice", MethodKind::Backup, RegisterOptions::default())
        .await;
    assert!(matches!(result, Err(MfaError::Unsupported(_))));

    assert!(h.service.registry().list_methods("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delivery_failure_stores_nothing() {
    let store = InMemoryStore::new();
    let service = MfaService::with_components(
        common::test_config(),
        Arc::new(store.clone()),
        Arc::new(FailingChannel),
        Arc::new(TotpService::new()),
        Arc::new(ManualClock::new(common::start_time())),
    )
    .unwrap();

    let result = service
        .registry()
        .register_method("bob", MethodKind::Sms, RegisterOptions::with_destination("+15550001"))
        .await;
    assert!(matches!(result, Err(MfaError::Delivery(_))));
    assert!(store.list_methods("bob").await.unwrap().is_empty());
    assert_eq!(store.challenge_count().await, 0);
}

#[tokio::test]
async fn test_backup_codes_are_distinct_and_verified() {
    let (h, _) = Harness::in_memory();

    let codes = h.service.backup_codes().generate_backup_codes("dave", None).await.unwrap();
    assert_eq!(codes.len(), 10);

    let mut unique = codes.codes.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 10);
    assert!(codes
        .codes
        .iter()
        .all(|c| c.len() == 8 && c.chars().all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit())));

    let methods = h.service.registry().list_methods("dave").await.unwrap();
    assert_eq!(methods.len(), 10);
    assert!(methods
        .iter()
        .all(|m| m.kind == MethodKind::Backup && m.is_verified && !m.is_primary));
    // Only hashes are kept
    assert!(methods
        .iter()
        .all(|m| m.secret.as_deref().is_some_and(|s| s.starts_with("$argon2id$"))));
}

#[tokio::test]
async fn test_backup_code_redeemed_once() {
    let (h, _) = Harness::in_memory();
    h.enroll_totp("dave").await;
    let codes = h.service.backup_codes().generate_backup_codes("dave", Some(3)).await.unwrap();

    // Display form with a dash and lower case is accepted
    let display = codes.display_codes()[1].to_lowercase();
    let verification = h
        .service
        .verifier()
        .redeem_backup_code("dave", &display)
        .await
        .unwrap();
    assert_eq!(verification.kind, MethodKind::Backup);
    assert_eq!(h.service.backup_codes().remaining_backup_codes("dave").await.unwrap(), 2);

    let result = h.service.verifier().redeem_backup_code("dave", &codes.codes[1]).await;
    assert!(matches!(result, Err(MfaError::InvalidCode)));
}

#[tokio::test]
async fn test_backup_challenge_consumes_method() {
    let (h, store) = Harness::in_memory();
    h.enroll_totp("dave").await;
    let codes = h.service.backup_codes().generate_backup_codes("dave", Some(1)).await.unwrap();
    let backup = h
        .service
        .registry()
        .list_methods("dave")
        .await
        .unwrap()
        .into_iter()
        .find(|m| m.kind == MethodKind::Backup)
        .unwrap();

    let issued = h
        .service
        .issuer()
        .issue_challenge("dave", Some(backup.id))
        .await
        .unwrap();
    h.service
        .verifier()
        .verify_challenge(issued.challenge_id, &codes.codes[0])
        .await
        .unwrap();

    assert!(store.get_method(backup.id).await.unwrap().is_none());
    let challenge = store.get_challenge(issued.challenge_id).await.unwrap().unwrap();
    assert_eq!(challenge.state, ChallengeState::Consumed);

    let events: Vec<MfaEventType> = store
        .audit_log("dave")
        .await
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&MfaEventType::BackupCodeUsed));
}

#[tokio::test]
async fn test_regenerate_replaces_backup_codes() {
    let (h, _) = Harness::in_memory();
    h.enroll_totp("dave").await;
    let old = h.service.backup_codes().generate_backup_codes("dave", Some(4)).await.unwrap();

    let new = h.service.backup_codes().regenerate_backup_codes("dave", Some(2)).await.unwrap();
    assert_eq!(new.len(), 2);
    assert_eq!(h.service.backup_codes().remaining_backup_codes("dave").await.unwrap(), 2);

    let result = h.service.verifier().redeem_backup_code("dave", &old.codes[0]).await;
    assert!(matches!(result, Err(MfaError::InvalidCode)));
}

#[tokio::test]
async fn test_regenerate_zero_keeps_last_verified() {
    let (h, _) = Harness::in_memory();
    h.service.backup_codes().generate_backup_codes("erin", Some(2)).await.unwrap();

    let result = h.service.backup_codes().regenerate_backup_codes("erin", Some(0)).await;
    assert!(matches!(result, Err(MfaError::InvariantViolation(_))));
    assert_eq!(h.service.backup_codes().remaining_backup_codes("erin").await.unwrap(), 2);
}

#[tokio::test]
async fn test_status_summary() {
    let (h, _) = Harness::in_memory();
    let status = h.service.status("alice").await.unwrap();
    assert!(!status.is_enabled);
    assert!(status.primary_method.is_none());

    let (totp, _) = h.enroll_totp("alice").await;
    h.service.backup_codes().generate_backup_codes("alice", Some(5)).await.unwrap();

    let status = h.service.status("alice").await.unwrap();
    assert!(status.is_enabled);
    assert_eq!(status.primary_method, Some(totp));
    assert_eq!(status.backup_codes_remaining, 5);
}

#[tokio::test]
async fn test_purge_stale_challenges() {
    let (h, store) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    h.service.issuer().cancel_challenge(issued.challenge_id).await.unwrap();
    let live = h.service.issuer().issue_challenge("bob", None).await.unwrap();

    h.clock.advance(Duration::minutes(1));
    let removed = h
        .service
        .issuer()
        .purge_stale_challenges(h.clock.now())
        .await
        .unwrap();

    // The consumed enrollment challenge and the cancelled one go; the live one stays
    assert_eq!(removed, 2);
    assert!(store.get_challenge(issued.challenge_id).await.unwrap().is_none());
    assert!(store.get_challenge(live.challenge_id).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_verify_succeeds_once() {
    let (h, _) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;
    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    let challenge_id = issued.challenge_id;
    let code = h.channel.last_code();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = h.service.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move {
            service.verifier().verify_challenge(challenge_id, &code).await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(matches!(e, MfaError::NotFound(_))),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_primary_keeps_one_primary() {
    let (h, _) = Harness::in_memory();
    h.enroll_totp("alice").await;
    let sms = h.enroll_channel("alice", MethodKind::Sms, "+15550002").await;
    let email = h.enroll_channel("alice", MethodKind::Email, "alice@example.com").await;

    let mut handles = Vec::new();
    for round in 0..10 {
        let service = h.service.clone();
        let target = if round % 2 == 0 { sms } else { email };
        handles.push(tokio::spawn(async move {
            service.registry().set_primary_method(target).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let primaries = h
        .service
        .registry()
        .list_methods("alice")
        .await
        .unwrap()
        .iter()
        .filter(|m| m.is_primary)
        .count();
    assert_eq!(primaries, 1);
}

#[tokio::test]
async fn test_sqlite_backed_flow() {
    let store = SqliteStore::in_memory().await.unwrap();
    let h = Harness::with_store(Arc::new(store.clone()));

    let sms = h.enroll_channel("frank", MethodKind::Sms, "+15550009").await;
    let codes = h.service.backup_codes().generate_backup_codes("frank", Some(2)).await.unwrap();

    let issued = h.service.issuer().issue_challenge("frank", None).await.unwrap();
    assert_eq!(issued.method_id, sms);
    h.service
        .verifier()
        .verify_challenge(issued.challenge_id, &h.channel.last_code())
        .await
        .unwrap();

    h.service
        .verifier()
        .redeem_backup_code("frank", &codes.codes[0])
        .await
        .unwrap();
    h.service.registry().remove_method(sms).await.unwrap();

    let methods = store.list_methods("frank").await.unwrap();
    assert_eq!(methods.len(), 1);
    assert_eq!(methods[0].kind, MethodKind::Backup);

    let events = store.audit_events("frank").await.unwrap();
    assert!(events.iter().any(|e| e == "backup_code_used"));
    assert!(events.iter().any(|e| e == "method_removed"));
}

#[tokio::test]
async fn test_first_confirmed_method_primary_after_backup_codes() {
    let (h, _) = Harness::in_memory();
    h.service.backup_codes().generate_backup_codes("gina", Some(2)).await.unwrap();
    assert!(h.service.status("gina").await.unwrap().primary_method.is_none());

    let (totp, _) = h.enroll_totp("gina").await;

    // Backup codes never hold the primary slot, so the first real factor takes it
    let status = h.service.status("gina").await.unwrap();
    assert_eq!(status.primary_method, Some(totp));
    assert_eq!(status.verified_methods, 3);

    let issued = h.service.issuer().issue_challenge("gina", None).await.unwrap();
    assert_eq!(issued.method_id, totp);
}

#[tokio::test]
async fn test_second_confirmed_method_not_promoted() {
    let (h, _) = Harness::in_memory();
    let (totp, _) = h.enroll_totp("gina").await;
    let sms = h.enroll_channel("gina", MethodKind::Sms, "+15550007").await;

    assert!(h.service.registry().get_method(totp).await.unwrap().is_primary);
    assert!(!h.service.registry().get_method(sms).await.unwrap().is_primary);
}

#[tokio::test]
async fn test_cancelled_challenge_rejects_correct_code() {
    let (h, _) = Harness::in_memory();
    h.enroll_channel("bob", MethodKind::Sms, "+15550001").await;

    let issued = h.service.issuer().issue_challenge("bob", None).await.unwrap();
    let code = h.channel.last_code();
    h.service.issuer().cancel_challenge(issued.challenge_id).await.unwrap();

    let result = h.service.verifier().verify_challenge(issued.challenge_id, &code).await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));
}

#[tokio::test]
async fn test_resend_after_expired_enrollment_code() {
    let (h, _) = Harness::in_memory();
    let registration = h
        .service
        .registry()
        .register_method("bob", MethodKind::Sms, RegisterOptions::with_destination("+15550001"))
        .await
        .unwrap();
    let first_code = h.channel.last_code();
    h.clock.advance(Duration::minutes(6));

    let result = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &first_code)
        .await;
    assert!(matches!(result, Err(MfaError::Expired)));

    let challenge_id = h
        .service
        .registry()
        .resend_enrollment_code(registration.method.id)
        .await
        .unwrap();
    assert_ne!(Some(challenge_id), registration.enrollment_challenge_id);
    assert_eq!(h.channel.deliveries().len(), 2);

    let method = h
        .service
        .registry()
        .confirm_enrollment(registration.method.id, &h.channel.last_code())
        .await
        .unwrap();
    assert!(method.is_verified);
}

#[tokio::test]
async fn test_resend_supersedes_previous_enrollment_code() {
    let (h, _) = Harness::in_memory();
    let registration = h
        .service
        .registry()
        .register_method("bob", MethodKind::Email, RegisterOptions::with_destination("bob@example.com"))
        .await
        .unwrap();
    let first_code = h.channel.last_code();

    h.service
        .registry()
        .resend_enrollment_code(registration.method.id)
        .await
        .unwrap();
    let second_code = h.channel.last_code();

    if first_code != second_code {
        let result = h
            .service
            .registry()
            .confirm_enrollment(registration.method.id, &first_code)
            .await;
        assert!(matches!(result, Err(MfaError::InvalidCode)));
    }
    h.service
        .registry()
        .confirm_enrollment(registration.method.id, &second_code)
        .await
        .unwrap();

    // Nothing left to resend once verified
    let result = h
        .service
        .registry()
        .resend_enrollment_code(registration.method.id)
        .await;
    assert!(matches!(result, Err(MfaError::NotFound(_))));
}

#[tokio::test]
async fn test_resend_rejected_for_totp() {
    let (h, _) = Harness::in_memory();
    let registration = h
        .service
        .registry()
        .register_method("alice", MethodKind::Totp, RegisterOptions::default())
        .await
        .unwrap();

    let result = h
        .service
        .registry()
        .resend_enrollment_code(registration.method.id)
        .await;
    assert!(matches!(result, Err(MfaError::Unsupported(_))));
}

/// Two services sharing one store each remove one of the user's two verified
/// methods at the same time; exactly one removal may win.
async fn assert_cross_service_removal_keeps_one(store: Arc<dyn MfaStore>) {
    let shared: Arc<dyn MfaStore> = Arc::new(LaggingStore::new(
        store,
        std::time::Duration::from_millis(50),
    ));
    let first = Harness::with_store(Arc::clone(&shared));
    let second = Harness::with_store(Arc::clone(&shared));

    let (totp, _) = first.enroll_totp("hank").await;
    let sms = first.enroll_channel("hank", MethodKind::Sms, "+15550010").await;

    let (r1, r2) = tokio::join!(
        first.service.registry().remove_method(totp),
        second.service.registry().remove_method(sms),
    );

    let outcomes = [r1, r2];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(MfaError::InvariantViolation(_)))));

    let methods = shared.list_methods("hank").await.unwrap();
    assert_eq!(methods.iter().filter(|m| m.is_verified).count(), 1);
    assert_eq!(methods.iter().filter(|m| m.is_primary).count(), 1);
}

#[tokio::test]
async fn test_cross_service_removal_in_memory() {
    assert_cross_service_removal_keeps_one(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_cross_service_removal_sqlite() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert_cross_service_removal_keeps_one(Arc::new(store)).await;
}

#[tokio::test]
async fn test_cross_service_set_primary_keeps_one_primary() {
    let shared: Arc<dyn MfaStore> = Arc::new(LaggingStore::new(
        Arc::new(InMemoryStore::new()),
        std::time::Duration::from_millis(50),
    ));
    let first = Harness::with_store(Arc::clone(&shared));
    let second = Harness::with_store(Arc::clone(&shared));

    first.enroll_totp("ivy").await;
    let sms = first.enroll_channel("ivy", MethodKind::Sms, "+15550011").await;
    let email = first.enroll_channel("ivy", MethodKind::Email, "ivy@example.com").await;

    let (r1, r2) = tokio::join!(
        first.service.registry().set_primary_method(sms),
        second.service.registry().set_primary_method(email),
    );
    for result in [r1, r2] {
        assert!(matches!(result, Ok(_) | Err(MfaError::InvariantViolation(_))));
    }

    let primaries = shared
        .list_methods("ivy")
        .await
        .unwrap()
        .iter()
        .filter(|m| m.is_primary)
        .count();
    assert_eq!(primaries, 1);
}
