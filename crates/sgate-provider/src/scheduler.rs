//! Provider selection, load accounting and cooldown recovery (§4.3).

use std::sync::Arc;

use rand::Rng;
use sgate_common::CredentialCipher;
use sgate_storage::entities::providers::Model as ProviderModel;
use sgate_storage::{GatewayStorage, ProviderCandidateFilter};
use sgate_upstream::ProviderCredential;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub health_threshold: i32,
    pub failure_threshold: i32,
    pub cooldown_ms: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_threshold: 50,
            failure_threshold: 5,
            cooldown_ms: 300_000,
        }
    }
}

/// A provider the caller has acquired: load is already incremented, and the
/// caller owes exactly one `release` regardless of outcome.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub provider_id: i64,
    pub credential: ProviderCredential,
}

pub struct ProviderScheduler<S> {
    storage: Arc<S>,
    cipher: Arc<dyn CredentialCipher>,
    config: SchedulerConfig,
}

impl<S: GatewayStorage> ProviderScheduler<S> {
    pub fn new(storage: Arc<S>, cipher: Arc<dyn CredentialCipher>, config: SchedulerConfig) -> Self {
        Self {
            storage,
            cipher,
            config,
        }
    }

    /// Selects a candidate (excluding any id in `excluded`), atomically
    /// increments its load, and returns the acquired handle.
    pub async fn acquire(
        &self,
        group_id: Option<&str>,
        excluded: &[i64],
    ) -> Result<ProviderHandle, ProviderError> {
        let filter = ProviderCandidateFilter {
            group_id: group_id.map(str::to_string),
            health_threshold: self.config.health_threshold,
        };
        let candidates: Vec<ProviderModel> = self
            .storage
            .candidate_providers(&filter)
            .await?
            .into_iter()
            .filter(|p| !excluded.contains(&p.id))
            .collect();

        let chosen = weighted_choice(&candidates).ok_or(ProviderError::NoAvailableProvider)?;
        let acquired = self
            .storage
            .acquire_provider_load(chosen.id)
            .await?
            .ok_or(ProviderError::NoAvailableProvider)?;

        let credential = self.decrypt_credential(&acquired)?;
        Ok(ProviderHandle {
            provider_id: acquired.id,
            credential,
        })
    }

    pub async fn release(&self, provider_id: i64) -> Result<(), ProviderError> {
        self.storage.release_provider_load(provider_id).await?;
        Ok(())
    }

    pub async fn record_success(&self, provider_id: i64) -> Result<(), ProviderError> {
        self.storage.record_provider_success(provider_id).await?;
        Ok(())
    }

    pub async fn record_failure(&self, provider_id: i64) -> Result<(), ProviderError> {
        self.storage
            .record_provider_failure(
                provider_id,
                self.config.failure_threshold,
                self.config.cooldown_ms,
            )
            .await?;
        Ok(())
    }

    /// Runs one pass of cooldown recovery; the caller schedules this on a
    /// one-minute interval (§4.5).
    pub async fn recover_cooling_providers(&self) -> Result<u64, ProviderError> {
        Ok(self.storage.recover_cooling_providers().await?)
    }

    fn decrypt_credential(&self, model: &ProviderModel) -> Result<ProviderCredential, ProviderError> {
        let plaintext = self.cipher.decrypt(&model.cookie_secret)?;
        let cookie_bag =
            String::from_utf8(plaintext).map_err(|_| ProviderError::MalformedCredential)?;
        Ok(ProviderCredential {
            provider_id: model.id,
            csesidx: model.csesidx.clone(),
            cookie_bag,
        })
    }
}

/// `weight = health_score * (1 - current_load/max_concurrent)`. Falls back to
/// the first candidate when every weight is zero, so a pool of otherwise-tied
/// providers never starves.
fn weighted_choice(candidates: &[ProviderModel]) -> Option<&ProviderModel> {
    if candidates.is_empty() {
        return None;
    }
    let weights: Vec<f64> = candidates
        .iter()
        .map(|c| {
            let load_ratio = if c.max_concurrent <= 0 {
                1.0
            } else {
                f64::from(c.current_load) / f64::from(c.max_concurrent)
            };
            (f64::from(c.health_score) * (1.0 - load_ratio)).max(0.0)
        })
        .collect();

    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return candidates.first();
    }

    let mut pick = rand::rng().random::<f64>() * total;
    for (candidate, weight) in candidates.iter().zip(weights.iter()) {
        if pick < *weight {
            return Some(candidate);
        }
        pick -= weight;
    }
    candidates.last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_common::{AesGcmCipher, CipherMode};
    use sgate_storage::fake::FakeStorage;
    use time::OffsetDateTime;

    fn cipher() -> Arc<dyn CredentialCipher> {
        use base64::Engine;
        let key = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);
        Arc::new(AesGcmCipher::new(&key, CipherMode::Strict).unwrap())
    }

    fn provider_with_secret(id: i64, cipher: &dyn CredentialCipher, load: i32, max: i32) -> ProviderModel {
        let now = OffsetDateTime::now_utc();
        ProviderModel {
            id,
            name: format!("provider-{id}"),
            group_id: None,
            csesidx: format!("cses-{id}"),
            cookie_secret: cipher.encrypt(b"cookie-bag").unwrap(),
            max_concurrent: max,
            status: sgate_storage::entities::providers::status::ACTIVE.to_string(),
            health_score: 80,
            current_load: load,
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

    #[tokio::test]
    async fn acquire_decrypts_the_credential_and_bumps_load() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider_with_secret(1, cipher.as_ref(), 0, 10));
        let scheduler = ProviderScheduler::new(storage.clone(), cipher, SchedulerConfig::default());

        let handle = scheduler.acquire(None, &[]).await.unwrap();
        assert_eq!(handle.provider_id, 1);
        assert_eq!(handle.credential.cookie_bag, "cookie-bag");

        let snapshot = storage.providers_snapshot();
        assert_eq!(snapshot[0].current_load, 1);
    }

    #[tokio::test]
    async fn acquire_fails_with_no_candidates() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        let scheduler = ProviderScheduler::new(storage, cipher, SchedulerConfig::default());
        let err = scheduler.acquire(None, &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoAvailableProvider));
    }

    #[tokio::test]
    async fn excluded_provider_is_never_chosen() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider_with_secret(1, cipher.as_ref(), 0, 10));
        let scheduler = ProviderScheduler::new(storage, cipher, SchedulerConfig::default());

        let err = scheduler.acquire(None, &[1]).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoAvailableProvider));
    }

    #[tokio::test]
    async fn release_decrements_load() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider_with_secret(1, cipher.as_ref(), 0, 10));
        let scheduler = ProviderScheduler::new(storage.clone(), cipher, SchedulerConfig::default());

        scheduler.acquire(None, &[]).await.unwrap();
        scheduler.release(1).await.unwrap();
        assert_eq!(storage.providers_snapshot()[0].current_load, 0);
    }

    #[tokio::test]
    async fn repeated_failures_cool_the_provider_down() {
        let cipher = cipher();
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(provider_with_secret(1, cipher.as_ref(), 0, 10));
        let scheduler = ProviderScheduler::new(
            storage.clone(),
            cipher,
            SchedulerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
        );

        scheduler.record_failure(1).await.unwrap();
        scheduler.record_failure(1).await.unwrap();
        let snapshot = storage.providers_snapshot();
        assert_eq!(
            snapshot[0].status,
            sgate_storage::entities::providers::status::COOLING
        );
    }
}
