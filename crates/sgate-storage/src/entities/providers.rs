use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    pub group_id: Option<String>,
    /// Upstream session-index id (`csesidx`).
    pub csesidx: String,
    /// AES-GCM encrypted cookie bag; opaque outside `sgate-upstream`.
    pub cookie_secret: Vec<u8>,
    pub max_concurrent: i32,
    /// `active` | `cooling` | `failed` | `inactive`.
    pub status: String,
    pub health_score: i32,
    pub current_load: i32,
    pub consecutive_failures: i32,
    pub total_requests: i64,
    pub failed_requests: i64,
    pub last_success_at: Option<OffsetDateTime>,
    pub last_failure_at: Option<OffsetDateTime>,
    pub cooldown_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub sessions: HasMany<super::sessions::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

/// Operational status values stored in `providers.status`.
pub mod status {
    pub const ACTIVE: &str = "active";
    pub const COOLING: &str = "cooling";
    pub const FAILED: &str = "failed";
    pub const INACTIVE: &str = "inactive";
}
