//! In-memory `GatewayStorage` used by scheduler/matcher unit tests so they
//! don't need a live database connection.

use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::entities::api_keys::Model as ApiKeyModel;
use crate::entities::providers::Model as ProviderModel;
use crate::entities::providers::status as provider_status;
use crate::entities::sessions::Model as SessionModel;
use crate::entities::sessions::status as session_status;
use crate::storage::{
    GatewayStorage, NewRequestLog, NewSession, ProviderCandidateFilter, StorageError,
    StorageResult,
};

#[derive(Default)]
struct State {
    providers: Vec<ProviderModel>,
    sessions: Vec<SessionModel>,
    api_keys: Vec<ApiKeyModel>,
    next_session_id: i64,
}

pub struct FakeStorage {
    state: Mutex<State>,
}

impl Default for FakeStorage {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_session_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_provider(&self, provider: ProviderModel) {
        self.state.lock().unwrap().providers.push(provider);
    }

    pub fn seed_api_key(&self, key: ApiKeyModel) {
        self.state.lock().unwrap().api_keys.push(key);
    }

    pub fn providers_snapshot(&self) -> Vec<ProviderModel> {
        self.state.lock().unwrap().providers.clone()
    }

    pub fn sessions_snapshot(&self) -> Vec<SessionModel> {
        self.state.lock().unwrap().sessions.clone()
    }

    /// Overwrites an already-seeded provider row, keyed by id. Used by tests
    /// that need to flip a provider's status mid-test.
    pub fn replace_provider(&self, provider: ProviderModel) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.providers.iter_mut().find(|p| p.id == provider.id) {
            *slot = provider;
        } else {
            state.providers.push(provider);
        }
    }

    pub fn active_session_count(&self, user_id: i64) -> usize {
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == session_status::ACTIVE)
            .count()
    }
}

#[async_trait]
impl GatewayStorage for FakeStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn candidate_providers(
        &self,
        filter: &ProviderCandidateFilter,
    ) -> StorageResult<Vec<ProviderModel>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<ProviderModel> = state
            .providers
            .iter()
            .filter(|p| p.status == provider_status::ACTIVE)
            .filter(|p| p.health_score >= filter.health_threshold)
            .filter(|p| p.current_load < p.max_concurrent)
            .filter(|p| match &filter.group_id {
                Some(g) => p.group_id.as_deref() == Some(g.as_str()),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            let ratio = |m: &ProviderModel| {
                if m.max_concurrent <= 0 {
                    1.0
                } else {
                    f64::from(m.current_load) / f64::from(m.max_concurrent)
                }
            };
            b.health_score.cmp(&a.health_score).then(
                ratio(a)
                    .partial_cmp(&ratio(b))
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        rows.truncate(20);
        Ok(rows)
    }

    async fn get_provider(&self, id: i64) -> StorageResult<Option<ProviderModel>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .providers
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn acquire_provider_load(&self, id: i64) -> StorageResult<Option<ProviderModel>> {
        let mut state = self.state.lock().unwrap();
        let Some(p) = state.providers.iter_mut().find(|p| p.id == id) else {
            return Ok(None);
        };
        p.current_load += 1;
        p.updated_at = OffsetDateTime::now_utc();
        Ok(Some(p.clone()))
    }

    async fn release_provider_load(&self, id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.providers.iter_mut().find(|p| p.id == id) {
            p.current_load = (p.current_load - 1).max(0);
            p.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn record_provider_success(&self, id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.providers.iter_mut().find(|p| p.id == id) {
            p.consecutive_failures = 0;
            p.health_score = (p.health_score + 1).min(100);
            p.total_requests += 1;
            p.last_success_at = Some(OffsetDateTime::now_utc());
            p.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn record_provider_failure(
        &self,
        id: i64,
        failure_threshold: i32,
        cooldown_ms: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(p) = state.providers.iter_mut().find(|p| p.id == id) {
            let now = OffsetDateTime::now_utc();
            p.consecutive_failures += 1;
            p.health_score = (p.health_score - 10).max(0);
            p.total_requests += 1;
            p.failed_requests += 1;
            p.last_failure_at = Some(now);
            p.updated_at = now;
            if p.consecutive_failures >= failure_threshold * 2 {
                p.status = provider_status::FAILED.to_string();
            } else if p.consecutive_failures >= failure_threshold {
                p.status = provider_status::COOLING.to_string();
                p.cooldown_until = Some(now + time::Duration::milliseconds(cooldown_ms));
            }
        }
        Ok(())
    }

    async fn recover_cooling_providers(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let mut n = 0u64;
        for p in state.providers.iter_mut() {
            if p.status == provider_status::COOLING
                && p.cooldown_until.is_some_and(|c| c <= now)
            {
                p.status = provider_status::ACTIVE.to_string();
                p.health_score = 50;
                p.consecutive_failures = 0;
                p.cooldown_until = None;
                p.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn find_matching_session(
        &self,
        user_id: i64,
        head_hash: &str,
        tail_hash: &str,
    ) -> StorageResult<Option<SessionModel>> {
        let state = self.state.lock().unwrap();
        let provider_is_active = |provider_id: i64| {
            state
                .providers
                .iter()
                .any(|p| p.id == provider_id && p.status == provider_status::ACTIVE)
        };
        let mut active: Vec<&SessionModel> = state
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == session_status::ACTIVE)
            .filter(|s| provider_is_active(s.provider_id))
            .collect();
        active.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));

        if let Some(exact) = active
            .iter()
            .find(|s| s.head_hash == head_hash && s.tail_hash == tail_hash)
        {
            return Ok(Some((*exact).clone()));
        }
        if let Some(head_only) = active.iter().find(|s| s.head_hash == head_hash) {
            return Ok(Some((*head_only).clone()));
        }
        Ok(None)
    }

    async fn count_active_sessions(&self, user_id: i64) -> StorageResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == session_status::ACTIVE)
            .count() as u64)
    }

    async fn evict_oldest_session(&self, user_id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        let oldest_id = state
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == session_status::ACTIVE)
            .min_by_key(|s| s.last_accessed_at)
            .map(|s| s.id);
        if let Some(id) = oldest_id {
            state.sessions.retain(|s| s.id != id);
        }
        Ok(())
    }

    async fn create_session(&self, new: NewSession) -> StorageResult<SessionModel> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_session_id;
        state.next_session_id += 1;
        let now = OffsetDateTime::now_utc();
        let model = SessionModel {
            id,
            user_id: new.user_id,
            provider_id: new.provider_id,
            head_hash: new.head_hash,
            tail_hash: new.tail_hash,
            upstream_session_id: new.upstream_session_id,
            message_count: 0,
            status: session_status::ACTIVE.to_string(),
            expires_at: new.expires_at,
            last_accessed_at: now,
            created_at: now,
        };
        state.sessions.push(model.clone());
        Ok(model)
    }

    async fn migrate_session(
        &self,
        old_id: i64,
        new_provider_id: i64,
        expires_at: OffsetDateTime,
    ) -> StorageResult<SessionModel> {
        let old = {
            let mut state = self.state.lock().unwrap();
            let Some(old) = state.sessions.iter_mut().find(|s| s.id == old_id) else {
                return Err(StorageError::Db(sea_orm::DbErr::RecordNotFound(format!(
                    "session {old_id} not found for migration"
                ))));
            };
            old.status = session_status::MIGRATED.to_string();
            old.clone()
        };

        self.create_session(NewSession {
            user_id: old.user_id,
            provider_id: new_provider_id,
            head_hash: old.head_hash,
            tail_hash: old.tail_hash,
            upstream_session_id: None,
            expires_at,
        })
        .await
    }

    async fn touch_session(
        &self,
        id: i64,
        last_accessed_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.iter_mut().find(|s| s.id == id) {
            s.last_accessed_at = last_accessed_at;
            s.expires_at = expires_at;
        }
        Ok(())
    }

    async fn update_session_tail_hash(
        &self,
        id: i64,
        tail_hash: &str,
        last_accessed_at: OffsetDateTime,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.iter_mut().find(|s| s.id == id) {
            s.tail_hash = tail_hash.to_string();
            s.last_accessed_at = last_accessed_at;
        }
        Ok(())
    }

    async fn increment_message_count(&self, id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.iter_mut().find(|s| s.id == id) {
            s.message_count += 1;
        }
        Ok(())
    }

    async fn set_session_upstream_id(
        &self,
        id: i64,
        upstream_session_id: &str,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sessions.iter_mut().find(|s| s.id == id) {
            s.upstream_session_id = Some(upstream_session_id.to_string());
        }
        Ok(())
    }

    async fn delete_stale_sessions(&self, now: OffsetDateTime) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| {
            s.status != session_status::MIGRATED
                && s.status != session_status::EXPIRED
                && s.expires_at > now
        });
        Ok((before - state.sessions.len()) as u64)
    }

    async fn find_api_key(&self, key_value: &str) -> StorageResult<Option<ApiKeyModel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .api_keys
            .iter()
            .find(|k| k.key_value == key_value && k.enabled)
            .cloned())
    }

    async fn increment_daily_usage(&self, id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(k) = state.api_keys.iter_mut().find(|k| k.id == id) {
            k.daily_usage += 1;
        }
        Ok(())
    }

    async fn touch_api_key_last_used(&self, id: i64, at: OffsetDateTime) -> StorageResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(k) = state.api_keys.iter_mut().find(|k| k.id == id) {
            k.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn reset_daily_usage(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().unwrap();
        for k in state.api_keys.iter_mut() {
            k.daily_usage = 0;
        }
        Ok(state.api_keys.len() as u64)
    }

    async fn insert_request_log(&self, _log: NewRequestLog) -> StorageResult<()> {
        Ok(())
    }

    async fn prune_request_logs_older_than(&self, _cutoff: OffsetDateTime) -> StorageResult<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: i64, health: i32, load: i32, max: i32) -> ProviderModel {
        let now = OffsetDateTime::now_utc();
        ProviderModel {
            id,
            name: format!("provider-{id}"),
            group_id: None,
            csesidx: "csesidx/test".to_string(),
            cookie_secret: vec![],
            max_concurrent: max,
            status: provider_status::ACTIVE.to_string(),
            health_score: health,
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
    async fn candidate_providers_excludes_full_load() {
        let storage = FakeStorage::new();
        storage.seed_provider(provider(1, 80, 10, 10));
        storage.seed_provider(provider(2, 80, 5, 10));
        let candidates = storage
            .candidate_providers(&ProviderCandidateFilter {
                group_id: None,
                health_threshold: 50,
            })
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, 2);
    }

    #[tokio::test]
    async fn acquire_then_release_returns_load_to_baseline() {
        let storage = FakeStorage::new();
        storage.seed_provider(provider(1, 80, 0, 10));
        storage.acquire_provider_load(1).await.unwrap();
        storage.acquire_provider_load(1).await.unwrap();
        storage.release_provider_load(1).await.unwrap();
        let p = storage.get_provider(1).await.unwrap().unwrap();
        assert_eq!(p.current_load, 1);
    }

    #[tokio::test]
    async fn release_saturates_at_zero() {
        let storage = FakeStorage::new();
        storage.seed_provider(provider(1, 80, 0, 10));
        storage.release_provider_load(1).await.unwrap();
        let p = storage.get_provider(1).await.unwrap().unwrap();
        assert_eq!(p.current_load, 0);
    }
}
