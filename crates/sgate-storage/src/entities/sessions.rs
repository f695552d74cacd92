use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub provider_id: i64,
    pub head_hash: String,
    pub tail_hash: String,
    pub upstream_session_id: Option<String>,
    pub message_count: i32,
    /// `active` | `expired` | `migrated`.
    pub status: String,
    pub expires_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}

pub mod status {
    pub const ACTIVE: &str = "active";
    pub const EXPIRED: &str = "expired";
    pub const MIGRATED: &str = "migrated";
}
