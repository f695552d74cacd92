//! Match-or-create lookup for a conversation's session row.

use std::sync::Arc;

use sgate_protocol::gemini::request::Content;
use sgate_storage::entities::providers::status as provider_status;
use sgate_storage::entities::sessions::Model as SessionModel;
use sgate_storage::{GatewayStorage, NewSession, StorageError};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::fingerprint::{Fingerprint, fingerprint};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How `matchOrCreate` resolved the incoming conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Head,
    Created,
}

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub session: SessionModel,
    pub kind: MatchKind,
}

pub struct SessionMatcher<S> {
    storage: Arc<S>,
    session_ttl: Duration,
    max_per_user: u32,
}

impl<S: GatewayStorage> SessionMatcher<S> {
    pub fn new(storage: Arc<S>, session_ttl_ms: i64, max_per_user: u32) -> Self {
        Self {
            storage,
            session_ttl: Duration::milliseconds(session_ttl_ms),
            max_per_user,
        }
    }

    /// Finds a continuing session for `contents`, or creates a fresh one bound
    /// to `provider_id`. Exact fingerprint matches take priority over
    /// head-only matches; `find_matching_session` itself excludes sessions
    /// bound to a provider that is no longer `active`, so any row it returns
    /// is reusable.
    pub async fn match_or_create(
        &self,
        user_id: i64,
        provider_id: i64,
        contents: &[Content],
    ) -> Result<MatchResult, SessionError> {
        let fp = fingerprint(contents);

        if let Some(mut found) = self
            .storage
            .find_matching_session(user_id, &fp.head_hash, &fp.tail_hash)
            .await?
        {
            let kind = if found.tail_hash == fp.tail_hash {
                MatchKind::Exact
            } else {
                MatchKind::Head
            };
            if kind == MatchKind::Head {
                self.storage
                    .update_session_tail_hash(found.id, &fp.tail_hash, OffsetDateTime::now_utc())
                    .await?;
                found.tail_hash = fp.tail_hash.clone();
            }
            return Ok(MatchResult {
                session: found,
                kind,
            });
        }

        let session = self.create(user_id, provider_id, &fp).await?;
        Ok(MatchResult {
            session,
            kind: MatchKind::Created,
        })
    }

    async fn create(
        &self,
        user_id: i64,
        provider_id: i64,
        fp: &Fingerprint,
    ) -> Result<SessionModel, SessionError> {
        if self.storage.count_active_sessions(user_id).await? >= self.max_per_user as u64 {
            self.storage.evict_oldest_session(user_id).await?;
        }

        let session = self
            .storage
            .create_session(NewSession {
                user_id,
                provider_id,
                head_hash: fp.head_hash.clone(),
                tail_hash: fp.tail_hash.clone(),
                upstream_session_id: None,
                expires_at: OffsetDateTime::now_utc() + self.session_ttl,
            })
            .await?;
        Ok(session)
    }

    /// Marks `session_id` migrated and creates its successor bound to
    /// `new_provider_id`, carrying the same fingerprints forward.
    pub async fn migrate(
        &self,
        session_id: i64,
        new_provider_id: i64,
    ) -> Result<SessionModel, SessionError> {
        let expires_at = OffsetDateTime::now_utc() + self.session_ttl;
        let migrated = self
            .storage
            .migrate_session(session_id, new_provider_id, expires_at)
            .await?;
        Ok(migrated)
    }

    /// Records a successful exchange: bumps `message_count` and extends the
    /// session's lifetime.
    pub async fn record_message(&self, session_id: i64) -> Result<(), SessionError> {
        self.storage.increment_message_count(session_id).await?;
        let expires_at = OffsetDateTime::now_utc() + self.session_ttl;
        self.storage
            .touch_session(session_id, OffsetDateTime::now_utc(), expires_at)
            .await?;
        Ok(())
    }

    pub async fn set_upstream_session_id(
        &self,
        session_id: i64,
        upstream_session_id: &str,
    ) -> Result<(), SessionError> {
        self.storage
            .set_session_upstream_id(session_id, upstream_session_id)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgate_protocol::gemini::request::{InputPart, Role};
    use sgate_storage::entities::providers::Model as ProviderModel;
    use sgate_storage::fake::FakeStorage;

    fn user(text: &str) -> Content {
        Content {
            role: Some(Role::User),
            parts: vec![InputPart {
                text: Some(text.to_string()),
            }],
        }
    }

    fn active_provider(id: i64) -> ProviderModel {
        let now = OffsetDateTime::now_utc();
        ProviderModel {
            id,
            name: format!("provider-{id}"),
            group_id: None,
            csesidx: "csesidx/test".to_string(),
            cookie_secret: vec![],
            max_concurrent: 10,
            status: provider_status::ACTIVE.to_string(),
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

    #[tokio::test]
    async fn creates_a_session_on_first_contact() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(active_provider(1));
        let matcher = SessionMatcher::new(storage, 3_600_000, 100);

        let result = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();
        assert_eq!(result.kind, MatchKind::Created);
        assert!(result.session.upstream_session_id.is_none());
    }

    #[tokio::test]
    async fn second_identical_message_is_an_exact_match() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(active_provider(1));
        let matcher = SessionMatcher::new(storage, 3_600_000, 100);

        let first = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();
        let second = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();
        assert_eq!(second.kind, MatchKind::Exact);
        assert_eq!(second.session.id, first.session.id);
    }

    #[tokio::test]
    async fn appended_turn_is_a_head_only_match() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(active_provider(1));
        let matcher = SessionMatcher::new(storage, 3_600_000, 100);

        let first = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();
        let second = matcher
            .match_or_create(9, 1, &[user("hello there"), user("and another thing")])
            .await
            .unwrap();
        assert_eq!(second.kind, MatchKind::Head);
        assert_eq!(second.session.id, first.session.id);
        assert_eq!(second.session.tail_hash, fingerprint(&[user("hello there"), user("and another thing")]).tail_hash);

        let persisted = storage
            .sessions_snapshot()
            .into_iter()
            .find(|s| s.id == first.session.id)
            .unwrap();
        assert_eq!(persisted.tail_hash, second.session.tail_hash);
        assert_ne!(persisted.tail_hash, first.session.tail_hash);
    }

    #[tokio::test]
    async fn session_bound_to_inactive_provider_is_not_reused() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(active_provider(1));
        let matcher = SessionMatcher::new(storage.clone(), 3_600_000, 100);

        let first = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();

        let mut cooled = active_provider(1);
        cooled.status = "cooling".to_string();
        storage.replace_provider(cooled);

        let second = matcher
            .match_or_create(9, 1, &[user("hello there")])
            .await
            .unwrap();
        assert_eq!(second.kind, MatchKind::Created);
        assert_ne!(second.session.id, first.session.id);
    }

    #[tokio::test]
    async fn eviction_kicks_in_past_the_per_user_cap() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_provider(active_provider(1));
        let matcher = SessionMatcher::new(storage.clone(), 3_600_000, 1);

        matcher
            .match_or_create(9, 1, &[user("first conversation")])
            .await
            .unwrap();
        let second = matcher
            .match_or_create(9, 1, &[user("second unrelated conversation")])
            .await
            .unwrap();

        assert_eq!(storage.active_session_count(9), 1);
        assert_eq!(second.kind, MatchKind::Created);
    }
}
