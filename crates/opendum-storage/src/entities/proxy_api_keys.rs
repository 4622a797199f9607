use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    /// SHA-256 hex digest; the secret itself is never stored.
    #[sea_orm(unique_key = "proxy_api_key_hash")]
    pub key_hash: String,
    /// `all`, `allowlist` or `denylist`.
    pub model_access_mode: String,
    pub model_access_list: Json,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
