//! Retry-with-substitution: run an operation against an acquired provider,
//! and on failure hand the next attempt a different one (§4.3).

use std::future::Future;

use sgate_storage::GatewayStorage;

use crate::error::ProviderError;
use crate::scheduler::{ProviderHandle, ProviderScheduler};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Runs `op` against providers acquired from `scheduler`, retrying up to
/// `max_retries` times with the previously-failed provider excluded on each
/// subsequent attempt. `release` is always called for every acquire,
/// including failed ones; the last error seen is returned on exhaustion.
pub async fn retry_with_substitution<S, F, Fut, T, E>(
    scheduler: &ProviderScheduler<S>,
    group_id: Option<&str>,
    max_retries: u32,
    mut op: F,
) -> Result<T, ProviderError>
where
    S: GatewayStorage,
    F: FnMut(ProviderHandle) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<ProviderError>,
{
    let mut excluded = Vec::new();
    let mut last_err = None;

    for _ in 0..max_retries.max(1) {
        let handle = match scheduler.acquire(group_id, &excluded).await {
            Ok(handle) => handle,
            Err(err) => {
                last_err = Some(err);
                break;
            }
        };
        let provider_id = handle.provider_id;

        match op(handle).await {
            Ok(value) => {
                let _ = scheduler.release(provider_id).await;
                let _ = scheduler.record_success(provider_id).await;
                return Ok(value);
            }
            Err(err) => {
                let err: ProviderError = err.into();
                let retryable = err.is_retryable();
                let _ = scheduler.release(provider_id).await;
                if retryable {
                    let _ = scheduler.record_failure(provider_id).await;
                    excluded.push(provider_id);
                    last_err = Some(err);
                } else {
                    // Not the provider's fault: neither a success nor a
                    // failure outcome, just an aborted attempt.
                    return Err(err);
                }
            }
        }
    }

    Err(last_err.unwrap_or(ProviderError::NoAvailableProvider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use base64::Engine;
    use sgate_common::{AesGcmCipher, CipherMode, CredentialCipher};
    use sgate_storage::entities::providers::Model as ProviderModel;
    use sgate_storage::entities::providers::status;
    use sgate_storage::fake::FakeStorage;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::OffsetDateTime;

    fn cipher() -> Arc<AesGcmCipher> {
        let key = base64::engine::general_purpose::STANDARD.encode([3u8; 32]);
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

    #[derive(Debug)]
    struct OpError;
    impl From<OpError> for ProviderError {
        fn from(_: OpError) -> Self {
            ProviderError::NoAvailableProvider
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_provider() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider(1, cipher.as_ref()));
        let scheduler = ProviderScheduler::new(storage.clone(), cipher, SchedulerConfig::default());

        let result: Result<&'static str, ProviderError> =
            retry_with_substitution(&scheduler, None, 3, |_handle| async { Ok::<_, OpError>("ok") })
                .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(storage.providers_snapshot()[0].current_load, 0);
    }

    #[tokio::test]
    async fn retries_with_a_different_provider_after_failure() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider(1, cipher.as_ref()));
        storage.seed_provider(provider(2, cipher.as_ref()));
        let scheduler = ProviderScheduler::new(storage.clone(), cipher, SchedulerConfig::default());

        let attempted = Arc::new(std::sync::Mutex::new(Vec::new()));
        let attempted_clone = attempted.clone();

        let result = retry_with_substitution(&scheduler, None, 3, move |handle| {
            let attempted = attempted_clone.clone();
            async move {
                attempted.lock().unwrap().push(handle.provider_id);
                if handle.provider_id == 1 {
                    Err(OpError)
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        let seen = attempted.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn exhausts_retries_and_surfaces_the_last_error() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider(1, cipher.as_ref()));
        let scheduler = ProviderScheduler::new(storage.clone(), cipher, SchedulerConfig::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), ProviderError> =
            retry_with_substitution(&scheduler, None, 3, move |_handle| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(OpError) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(storage.providers_snapshot()[0].current_load, 0);
    }
}
