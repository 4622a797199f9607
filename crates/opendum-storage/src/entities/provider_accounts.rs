use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub provider_account_id: Option<String>,
    /// Encrypted at rest; see crypto::FieldCipher.
    pub access_token: String,
    pub refresh_token: String,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub status: String,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub consecutive_errors: i32,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_error_at: Option<OffsetDateTime>,
    pub last_error_code: Option<i32>,
    pub last_error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
