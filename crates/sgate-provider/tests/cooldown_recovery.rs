use std::sync::Arc;

use base64::Engine;
use sgate_common::{AesGcmCipher, CipherMode, CredentialCipher};
use sgate_provider::{ProviderError, ProviderScheduler, SchedulerConfig};
use sgate_storage::entities::providers::Model as ProviderModel;
use sgate_storage::entities::providers::status;
use sgate_storage::fake::FakeStorage;
use time::OffsetDateTime;

fn cipher() -> Arc<dyn CredentialCipher> {
    let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    Arc::new(AesGcmCipher::new(&key, CipherMode::Strict).unwrap())
}

fn provider(id: i64, cipher: &dyn CredentialCipher) -> ProviderModel {
    let now = OffsetDateTime::now_utc();
    ProviderModel {
        id,
        name: format!("provider-{id}"),
        group_id: None,
        csesidx: format!("cses-{id}"),
        cookie_secret: cipher.encrypt(b"cookie-bag").unwrap(),
        max_concurrent: 10,
        status: status::ACTIVE.to_string(),
        health_score: 80,
        current_load: 0,
        consecutive_failures: 0,
        total_requests: 0,
        failed_requests: 0,
        last_success_at: None,
        last_failure_at: None,
        cooldown_until: None,
        created_at: now,
        updated_at: now,
    }
}

/// A provider that trips into cooldown is unselectable until a recovery pass
/// runs after its `cooldown_until` has elapsed.
#[tokio::test]
async fn cooled_provider_recovers_and_becomes_selectable_again() {
    let cipher = cipher();
    let storage = Arc::new(FakeStorage::new());
    storage.seed_provider(provider(1, cipher.as_ref()));
    let scheduler = ProviderScheduler::new(
        storage.clone(),
        cipher,
        SchedulerConfig {
            failure_threshold: 2,
            cooldown_ms: 50,
            ..Default::default()
        },
    );

    scheduler.record_failure(1).await.unwrap();
    scheduler.record_failure(1).await.unwrap();
    assert_eq!(storage.providers_snapshot()[0].status, status::COOLING);

    let err = scheduler.acquire(None, &[]).await.unwrap_err();
    assert!(matches!(err, ProviderError::NoAvailableProvider));

    let recovered = scheduler.recover_cooling_providers().await.unwrap();
    assert_eq!(recovered, 0, "cooldown has not elapsed yet");

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;

    let recovered = scheduler.recover_cooling_providers().await.unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(storage.providers_snapshot()[0].status, status::ACTIVE);

    let handle = scheduler.acquire(None, &[]).await.unwrap();
    assert_eq!(handle.provider_id, 1);
}

/// Enough consecutive failures to cross `2 * failure_threshold` marks the
/// provider `failed` instead of merely `cooling`, and recovery leaves it alone.
#[tokio::test]
async fn repeated_failure_past_double_threshold_is_failed_not_cooling() {
    let cipher = cipher();
    let storage = Arc::new(FakeStorage::new());
    storage.seed_provider(provider(1, cipher.as_ref()));
    let scheduler = ProviderScheduler::new(
        storage.clone(),
        cipher,
        SchedulerConfig {
            failure_threshold: 2,
            cooldown_ms: 50,
            ..Default::default()
        },
    );

    for _ in 0..4 {
        scheduler.record_failure(1).await.unwrap();
    }
    assert_eq!(storage.providers_snapshot()[0].status, status::FAILED);

    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let recovered = scheduler.recover_cooling_providers().await.unwrap();
    assert_eq!(recovered, 0, "failed providers are not auto-recovered");
    assert_eq!(storage.providers_snapshot()[0].status, status::FAILED);
}
