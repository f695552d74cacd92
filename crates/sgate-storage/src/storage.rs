use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue, ColumnTrait, Condition, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, QueryTrait, Schema,
};
use time::OffsetDateTime;

use crate::entities;
use crate::entities::api_keys::Model as ApiKeyModel;
use crate::entities::providers::Model as ProviderModel;
use crate::entities::sessions::Model as SessionModel;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Inputs to the candidate query in the provider scheduler.
#[derive(Debug, Clone, Default)]
pub struct ProviderCandidateFilter {
    pub group_id: Option<String>,
    pub health_threshold: i32,
}

/// A fresh session row to persist, either newly created or the successor of a
/// migrated one.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub provider_id: i64,
    pub head_hash: String,
    pub tail_hash: String,
    pub upstream_session_id: Option<String>,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewRequestLog {
    pub user_id: i64,
    pub api_key_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub session_id: Option<i64>,
    pub model: String,
    pub kind: &'static str,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub latency_ms: i64,
    pub status_code: i32,
    pub error_message: Option<String>,
}

/// Repository surface the scheduler, matcher, executor and maintenance loop
/// depend on. One trait, mirroring a single repository boundary rather than
/// a trait per table, so callers never see the ORM directly.
#[async_trait]
pub trait GatewayStorage: Send + Sync {
    async fn sync(&self) -> StorageResult<()>;

    // -- providers --------------------------------------------------------
    async fn candidate_providers(
        &self,
        filter: &ProviderCandidateFilter,
    ) -> StorageResult<Vec<ProviderModel>>;
    async fn get_provider(&self, id: i64) -> StorageResult<Option<ProviderModel>>;
    /// Increments `current_load` by one and returns the row as it now stands.
    async fn acquire_provider_load(&self, id: i64) -> StorageResult<Option<ProviderModel>>;
    /// Decrements `current_load` by one, saturating at zero.
    async fn release_provider_load(&self, id: i64) -> StorageResult<()>;
    async fn record_provider_success(&self, id: i64) -> StorageResult<()>;
    async fn record_provider_failure(
        &self,
        id: i64,
        failure_threshold: i32,
        cooldown_ms: i64,
    ) -> StorageResult<()>;
    /// Moves every `cooling` provider whose `cooldown_until` has passed back
    /// to `active`, resetting health and failure counters.
    async fn recover_cooling_providers(&self) -> StorageResult<u64>;

    // -- sessions -----------------------------------------------------------
    /// Exact (head, tail) match, falling back to head-only, both ordered by
    /// `last_accessed_at` descending. Only `active` sessions bound to an
    /// `active` provider are considered; a session pinned to a cooling or
    /// failed provider is invisible to both tiers.
    async fn find_matching_session(
        &self,
        user_id: i64,
        head_hash: &str,
        tail_hash: &str,
    ) -> StorageResult<Option<SessionModel>>;
    async fn count_active_sessions(&self, user_id: i64) -> StorageResult<u64>;
    /// Deletes the oldest-by-`last_accessed_at` active session for the user.
    async fn evict_oldest_session(&self, user_id: i64) -> StorageResult<()>;
    async fn create_session(&self, new: NewSession) -> StorageResult<SessionModel>;
    /// Marks `old_id` `migrated` and inserts a fresh `active` row carrying the
    /// same fingerprints, bound to `new_provider_id`. The new row never
    /// carries over `upstream_session_id`.
    async fn migrate_session(
        &self,
        old_id: i64,
        new_provider_id: i64,
        expires_at: OffsetDateTime,
    ) -> StorageResult<SessionModel>;
    async fn touch_session(
        &self,
        id: i64,
        last_accessed_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> StorageResult<()>;
    /// Head-only match: the incoming conversation's tail diverged from what
    /// was last stored, so the row's `tail_hash` follows it forward while the
    /// anchoring `head_hash` stays put (§4.2 lookup order, step 2).
    async fn update_session_tail_hash(
        &self,
        id: i64,
        tail_hash: &str,
        last_accessed_at: OffsetDateTime,
    ) -> StorageResult<()>;
    async fn increment_message_count(&self, id: i64) -> StorageResult<()>;
    async fn set_session_upstream_id(
        &self,
        id: i64,
        upstream_session_id: &str,
    ) -> StorageResult<()>;
    async fn delete_stale_sessions(&self, now: OffsetDateTime) -> StorageResult<u64>;

    // -- api keys -------------------------------------------------------
    async fn find_api_key(&self, key_value: &str) -> StorageResult<Option<ApiKeyModel>>;
    async fn increment_daily_usage(&self, id: i64) -> StorageResult<()>;
    async fn touch_api_key_last_used(&self, id: i64, at: OffsetDateTime) -> StorageResult<()>;
    async fn reset_daily_usage(&self) -> StorageResult<u64>;

    // -- request logs ----------------------------------------------------
    async fn insert_request_log(&self, log: NewRequestLog) -> StorageResult<()>;
    async fn prune_request_logs_older_than(&self, cutoff: OffsetDateTime) -> StorageResult<u64>;
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

#[async_trait]
impl GatewayStorage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Providers)
            .register(entities::Sessions)
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn candidate_providers(
        &self,
        filter: &ProviderCandidateFilter,
    ) -> StorageResult<Vec<ProviderModel>> {
        use entities::providers::Column;

        let mut query = entities::Providers::find()
            .filter(Column::Status.eq(entities::providers::status::ACTIVE))
            .filter(Column::HealthScore.gte(filter.health_threshold))
            .filter(Column::CurrentLoad.lt(Expr::col(Column::MaxConcurrent)));

        if let Some(group_id) = filter.group_id.as_deref() {
            query = query.filter(Column::GroupId.eq(group_id));
        }

        let mut rows = query
            .order_by_desc(Column::HealthScore)
            .all(&self.db)
            .await?;

        // `current_load / max_concurrent` ascending doesn't translate to a
        // portable SQL ORDER BY across sqlite/mysql/postgres without risking
        // a division by zero on `max_concurrent = 0`; sort it in memory.
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
        Ok(entities::Providers::find_by_id(id).one(&self.db).await?)
    }

    async fn acquire_provider_load(&self, id: i64) -> StorageResult<Option<ProviderModel>> {
        use entities::providers::Column;

        entities::Providers::update_many()
            .col_expr(Column::CurrentLoad, Expr::col(Column::CurrentLoad).add(1))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        self.get_provider(id).await
    }

    async fn release_provider_load(&self, id: i64) -> StorageResult<()> {
        use entities::providers::Column;

        // No portable GREATEST()/MAX() over a column and a literal across
        // sqlite/mysql/postgres through sea-query; clamp with CASE instead.
        entities::Providers::update_many()
            .col_expr(
                Column::CurrentLoad,
                Expr::case(
                    Expr::col(Column::CurrentLoad).gt(0),
                    Expr::col(Column::CurrentLoad).sub(1),
                )
                .finally(Expr::value(0))
                .into(),
            )
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_provider_success(&self, id: i64) -> StorageResult<()> {
        use entities::providers::ActiveModel as ProviderActive;

        let Some(model) = entities::Providers::find_by_id(id).one(&self.db).await? else {
            return Ok(());
        };
        let now = OffsetDateTime::now_utc();
        let mut active: ProviderActive = model.clone().into();
        active.consecutive_failures = ActiveValue::Set(0);
        active.health_score = ActiveValue::Set((model.health_score + 1).min(100));
        active.total_requests = ActiveValue::Set(model.total_requests + 1);
        active.last_success_at = ActiveValue::Set(Some(now));
        active.updated_at = ActiveValue::Set(now);
        active.update(&self.db).await?;
        Ok(())
    }

    async fn record_provider_failure(
        &self,
        id: i64,
        failure_threshold: i32,
        cooldown_ms: i64,
    ) -> StorageResult<()> {
        use entities::providers::Column;
        use entities::providers::status;

        // A prior find-then-update round trip races a concurrent success/
        // failure on the same provider between the read and the write.
        // Every column here is derived from the row as the single UPDATE
        // sees it, so the transition is one atomic statement.
        let now = OffsetDateTime::now_utc();
        let cooldown_until = now + time::Duration::milliseconds(cooldown_ms);
        let failures_after = Expr::col(Column::ConsecutiveFailures).add(1);
        let health_after = Expr::col(Column::HealthScore).sub(10);
        let reaches_failed = Expr::col(Column::ConsecutiveFailures)
            .add(1)
            .gte(failure_threshold * 2);
        let reaches_cooling = Expr::col(Column::ConsecutiveFailures)
            .add(1)
            .gte(failure_threshold);

        entities::Providers::update_many()
            .col_expr(Column::ConsecutiveFailures, failures_after)
            .col_expr(
                Column::HealthScore,
                Expr::case(health_after.clone().gt(0), health_after)
                    .finally(Expr::value(0))
                    .into(),
            )
            .col_expr(Column::TotalRequests, Expr::col(Column::TotalRequests).add(1))
            .col_expr(
                Column::FailedRequests,
                Expr::col(Column::FailedRequests).add(1),
            )
            .col_expr(Column::LastFailureAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .col_expr(
                Column::Status,
                Expr::case(reaches_failed, Expr::value(status::FAILED))
                    .case(reaches_cooling.clone(), Expr::value(status::COOLING))
                    .finally(Expr::col(Column::Status))
                    .into(),
            )
            .col_expr(
                Column::CooldownUntil,
                Expr::case(reaches_cooling, Expr::value(cooldown_until))
                    .finally(Expr::col(Column::CooldownUntil))
                    .into(),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn recover_cooling_providers(&self) -> StorageResult<u64> {
        use entities::providers::Column;
        use entities::providers::status;

        let now = OffsetDateTime::now_utc();
        let result = entities::Providers::update_many()
            .col_expr(Column::Status, Expr::value(status::ACTIVE))
            .col_expr(Column::HealthScore, Expr::value(50))
            .col_expr(Column::ConsecutiveFailures, Expr::value(0))
            .col_expr(Column::CooldownUntil, Expr::value(None::<OffsetDateTime>))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Status.eq(status::COOLING))
            .filter(Column::CooldownUntil.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_matching_session(
        &self,
        user_id: i64,
        head_hash: &str,
        tail_hash: &str,
    ) -> StorageResult<Option<SessionModel>> {
        use entities::providers::Column as ProviderColumn;
        use entities::providers::status as provider_status;
        use entities::sessions::Column;
        use entities::sessions::status;

        // Sessions pinned to a provider that's no longer `active` must be
        // invisible to both tiers below, not just skipped at the top one,
        // so a disqualified exact match falls through to a head-only match
        // on a different, still-active session instead of forcing a create.
        let active_providers = entities::Providers::find()
            .select_only()
            .column(ProviderColumn::Id)
            .filter(ProviderColumn::Status.eq(provider_status::ACTIVE))
            .into_query();

        let exact = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(status::ACTIVE))
            .filter(Column::HeadHash.eq(head_hash))
            .filter(Column::TailHash.eq(tail_hash))
            .filter(Column::ProviderId.in_subquery(active_providers.clone()))
            .order_by_desc(Column::LastAccessedAt)
            .one(&self.db)
            .await?;
        if exact.is_some() {
            return Ok(exact);
        }

        let head_only = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(status::ACTIVE))
            .filter(Column::HeadHash.eq(head_hash))
            .filter(Column::ProviderId.in_subquery(active_providers))
            .order_by_desc(Column::LastAccessedAt)
            .one(&self.db)
            .await?;
        Ok(head_only)
    }

    async fn count_active_sessions(&self, user_id: i64) -> StorageResult<u64> {
        use entities::sessions::Column;
        use entities::sessions::status;

        let count = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(status::ACTIVE))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn evict_oldest_session(&self, user_id: i64) -> StorageResult<()> {
        use entities::sessions::Column;
        use entities::sessions::status;

        let oldest = entities::Sessions::find()
            .filter(Column::UserId.eq(user_id))
            .filter(Column::Status.eq(status::ACTIVE))
            .order_by_asc(Column::LastAccessedAt)
            .one(&self.db)
            .await?;
        if let Some(model) = oldest {
            entities::Sessions::delete_by_id(model.id)
                .exec(&self.db)
                .await?;
        }
        Ok(())
    }

    async fn create_session(&self, new: NewSession) -> StorageResult<SessionModel> {
        use entities::sessions::ActiveModel as SessionActive;
        use entities::sessions::status;

        let now = OffsetDateTime::now_utc();
        let active = SessionActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(new.user_id),
            provider_id: ActiveValue::Set(new.provider_id),
            head_hash: ActiveValue::Set(new.head_hash),
            tail_hash: ActiveValue::Set(new.tail_hash),
            upstream_session_id: ActiveValue::Set(new.upstream_session_id),
            message_count: ActiveValue::Set(0),
            status: ActiveValue::Set(status::ACTIVE.to_string()),
            expires_at: ActiveValue::Set(new.expires_at),
            last_accessed_at: ActiveValue::Set(now),
            created_at: ActiveValue::Set(now),
        };
        let inserted = entities::Sessions::insert(active).exec(&self.db).await?;
        let model = entities::Sessions::find_by_id(inserted.last_insert_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                sea_orm::DbErr::RecordNotFound("session disappeared after insert".into())
            })?;
        Ok(model)
    }

    async fn migrate_session(
        &self,
        old_id: i64,
        new_provider_id: i64,
        expires_at: OffsetDateTime,
    ) -> StorageResult<SessionModel> {
        use entities::sessions::ActiveModel as SessionActive;
        use entities::sessions::status;

        let Some(old) = entities::Sessions::find_by_id(old_id).one(&self.db).await? else {
            return Err(StorageError::Db(sea_orm::DbErr::RecordNotFound(format!(
                "session {old_id} not found for migration"
            ))));
        };

        let mut old_active: SessionActive = old.clone().into();
        old_active.status = ActiveValue::Set(status::MIGRATED.to_string());
        old_active.update(&self.db).await?;

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
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(Column::LastAccessedAt, Expr::value(last_accessed_at))
            .col_expr(Column::ExpiresAt, Expr::value(expires_at))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_session_tail_hash(
        &self,
        id: i64,
        tail_hash: &str,
        last_accessed_at: OffsetDateTime,
    ) -> StorageResult<()> {
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(Column::TailHash, Expr::value(tail_hash.to_string()))
            .col_expr(Column::LastAccessedAt, Expr::value(last_accessed_at))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn increment_message_count(&self, id: i64) -> StorageResult<()> {
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(Column::MessageCount, Expr::col(Column::MessageCount).add(1))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_session_upstream_id(
        &self,
        id: i64,
        upstream_session_id: &str,
    ) -> StorageResult<()> {
        use entities::sessions::Column;

        entities::Sessions::update_many()
            .col_expr(
                Column::UpstreamSessionId,
                Expr::value(upstream_session_id.to_string()),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_stale_sessions(&self, now: OffsetDateTime) -> StorageResult<u64> {
        use entities::sessions::Column;
        use entities::sessions::status;

        let result = entities::Sessions::delete_many()
            .filter(
                Condition::any()
                    .add(Column::Status.eq(status::MIGRATED))
                    .add(Column::Status.eq(status::EXPIRED))
                    .add(Column::ExpiresAt.lte(now)),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_api_key(&self, key_value: &str) -> StorageResult<Option<ApiKeyModel>> {
        use entities::api_keys::Column;

        Ok(entities::ApiKeys::find()
            .filter(Column::KeyValue.eq(key_value))
            .filter(Column::Enabled.eq(true))
            .one(&self.db)
            .await?)
    }

    async fn increment_daily_usage(&self, id: i64) -> StorageResult<()> {
        use entities::api_keys::Column;

        entities::ApiKeys::update_many()
            .col_expr(Column::DailyUsage, Expr::col(Column::DailyUsage).add(1))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn touch_api_key_last_used(&self, id: i64, at: OffsetDateTime) -> StorageResult<()> {
        use entities::api_keys::Column;

        entities::ApiKeys::update_many()
            .col_expr(Column::LastUsedAt, Expr::value(at))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reset_daily_usage(&self) -> StorageResult<u64> {
        use entities::api_keys::Column;

        let result = entities::ApiKeys::update_many()
            .col_expr(Column::DailyUsage, Expr::value(0))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn insert_request_log(&self, log: NewRequestLog) -> StorageResult<()> {
        use entities::request_logs::ActiveModel as RequestLogActive;

        let active = RequestLogActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(log.user_id),
            api_key_id: ActiveValue::Set(log.api_key_id),
            provider_id: ActiveValue::Set(log.provider_id),
            session_id: ActiveValue::Set(log.session_id),
            model: ActiveValue::Set(log.model),
            kind: ActiveValue::Set(log.kind.to_string()),
            input_tokens: ActiveValue::Set(log.input_tokens),
            output_tokens: ActiveValue::Set(log.output_tokens),
            latency_ms: ActiveValue::Set(log.latency_ms),
            status_code: ActiveValue::Set(log.status_code),
            error_message: ActiveValue::Set(log.error_message),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::RequestLogs::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn prune_request_logs_older_than(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        use entities::request_logs::Column;

        let result = entities::RequestLogs::delete_many()
            .filter(Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
