use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Schema,
};
use sea_orm::{ConnectionTrait, Condition, ExprTrait};
use time::OffsetDateTime;

use crate::crypto::{CryptoError, FieldCipher};
use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("account not found: {0}")]
    AccountNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Degraded,
    Failed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Degraded => "degraded",
            AccountStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "degraded" => AccountStatus::Degraded,
            "failed" => AccountStatus::Failed,
            _ => AccountStatus::Active,
        }
    }
}

/// Decrypted in-memory view of one provider account row.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub provider_account_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub status: AccountStatus,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub consecutive_errors: i32,
    pub last_used_at: Option<OffsetDateTime>,
    pub last_error_at: Option<OffsetDateTime>,
    pub last_error_code: Option<i32>,
    pub last_error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: String,
    pub provider: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub provider_account_id: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

/// Token rotation payload. `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub api_key: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub status_code: u16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelAccess {
    All,
    Allowlist(Vec<String>),
    Denylist(Vec<String>),
}

impl ModelAccess {
    pub fn permits(&self, model: &str) -> bool {
        match self {
            ModelAccess::All => true,
            ModelAccess::Allowlist(models) => models.iter().any(|m| m == model),
            ModelAccess::Denylist(models) => !models.iter().any(|m| m == model),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiKeyRow {
    pub id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub access: ModelAccess,
}

#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub provider_account_id: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub status_code: i32,
    pub duration_ms: i64,
}

/// Persistence seam for the routing core. Runtime reads and writes are
/// all single-row; cross-row invariants live above this trait.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn schema_sync(&self) -> StorageResult<()>;

    async fn accounts_for_user(&self, user_id: &str) -> StorageResult<Vec<AccountRow>>;
    async fn account_by_id(&self, id: &str) -> StorageResult<Option<AccountRow>>;
    async fn upsert_account(&self, account: NewAccount) -> StorageResult<AccountRow>;
    async fn update_credentials(&self, id: &str, update: CredentialUpdate) -> StorageResult<()>;
    async fn touch_account_usage(&self, id: &str) -> StorageResult<()>;
    async fn record_success(&self, id: &str) -> StorageResult<()>;
    /// Increments failure counters and returns the new streak length.
    async fn record_failure(&self, id: &str, failure: FailureRecord) -> StorageResult<i32>;
    async fn set_account_status(
        &self,
        id: &str,
        status: AccountStatus,
        is_active: bool,
    ) -> StorageResult<()>;
    async fn rename_account(&self, id: &str, name: &str) -> StorageResult<()>;
    async fn set_account_enabled(&self, id: &str, enabled: bool) -> StorageResult<()>;
    async fn reset_account_counters(&self, id: &str) -> StorageResult<()>;
    async fn delete_account(&self, id: &str) -> StorageResult<()>;
    async fn accounts_expiring_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> StorageResult<Vec<AccountRow>>;

    async fn api_key_by_hash(&self, key_hash: &str) -> StorageResult<Option<ApiKeyRow>>;
    async fn insert_usage_log(&self, row: NewUsageLog) -> StorageResult<()>;
    async fn disabled_models(&self) -> StorageResult<Vec<String>>;
}

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
    cipher: FieldCipher,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str, cipher: FieldCipher) -> StorageResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db, cipher })
    }

    pub fn new(db: DatabaseConnection, cipher: FieldCipher) -> Self {
        Self { db, cipher }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    fn decrypt_row(&self, model: entities::provider_accounts::Model) -> StorageResult<AccountRow> {
        Ok(AccountRow {
            access_token: self.cipher.decrypt(&model.access_token)?,
            refresh_token: self.cipher.decrypt(&model.refresh_token)?,
            api_key: self.cipher.decrypt_opt(model.api_key.as_deref())?,
            id: model.id,
            user_id: model.user_id,
            provider: model.provider,
            name: model.name,
            email: model.email,
            provider_account_id: model.provider_account_id,
            project_id: model.project_id,
            tier: model.tier,
            expires_at: model.expires_at,
            is_active: model.is_active,
            status: AccountStatus::parse(&model.status),
            request_count: model.request_count,
            success_count: model.success_count,
            error_count: model.error_count,
            consecutive_errors: model.consecutive_errors,
            last_used_at: model.last_used_at,
            last_error_at: model.last_error_at,
            last_error_code: model.last_error_code,
            last_error_message: model.last_error_message,
        })
    }

    async fn account_model(
        &self,
        id: &str,
    ) -> StorageResult<entities::provider_accounts::Model> {
        entities::ProviderAccounts::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StorageError::AccountNotFound(id.to_string()))
    }
}

#[async_trait]
impl AccountStore for SeaOrmStore {
    async fn schema_sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ProviderAccounts)
            .register(entities::ProxyApiKeys)
            .register(entities::UsageLogs)
            .register(entities::DisabledModels)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn accounts_for_user(&self, user_id: &str) -> StorageResult<Vec<AccountRow>> {
        use entities::provider_accounts::Column;
        let rows = entities::ProviderAccounts::find()
            .filter(Column::UserId.eq(user_id))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        rows.into_iter().map(|row| self.decrypt_row(row)).collect()
    }

    async fn account_by_id(&self, id: &str) -> StorageResult<Option<AccountRow>> {
        let row = entities::ProviderAccounts::find_by_id(id.to_string())
            .one(&self.db)
            .await?;
        row.map(|row| self.decrypt_row(row)).transpose()
    }

    async fn upsert_account(&self, account: NewAccount) -> StorageResult<AccountRow> {
        use entities::provider_accounts::{ActiveModel, Column};
        let now = OffsetDateTime::now_utc();

        // One row per (user, provider, provider-side account) once the
        // upstream identity is known.
        let existing = match account.provider_account_id.as_deref() {
            Some(provider_account_id) => {
                entities::ProviderAccounts::find()
                    .filter(Column::UserId.eq(account.user_id.as_str()))
                    .filter(Column::Provider.eq(account.provider.as_str()))
                    .filter(Column::ProviderAccountId.eq(provider_account_id))
                    .one(&self.db)
                    .await?
            }
            None => None,
        };

        if let Some(model) = existing {
            let id = model.id.clone();
            let mut active: ActiveModel = model.into();
            active.access_token = ActiveValue::Set(self.cipher.encrypt(&account.access_token)?);
            active.refresh_token = ActiveValue::Set(self.cipher.encrypt(&account.refresh_token)?);
            active.api_key = ActiveValue::Set(self.cipher.encrypt_opt(account.api_key.as_deref())?);
            if account.email.is_some() {
                active.email = ActiveValue::Set(account.email);
            }
            if account.project_id.is_some() {
                active.project_id = ActiveValue::Set(account.project_id);
            }
            if account.tier.is_some() {
                active.tier = ActiveValue::Set(account.tier);
            }
            active.expires_at = ActiveValue::Set(account.expires_at);
            active.updated_at = ActiveValue::Set(now);
            active.update(&self.db).await?;
            return self
                .account_by_id(&id)
                .await?
                .ok_or(StorageError::AccountNotFound(id));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let active = ActiveModel {
            id: ActiveValue::Set(id.clone()),
            user_id: ActiveValue::Set(account.user_id),
            provider: ActiveValue::Set(account.provider),
            name: ActiveValue::Set(account.name),
            email: ActiveValue::Set(account.email),
            provider_account_id: ActiveValue::Set(account.provider_account_id),
            access_token: ActiveValue::Set(self.cipher.encrypt(&account.access_token)?),
            refresh_token: ActiveValue::Set(self.cipher.encrypt(&account.refresh_token)?),
            api_key: ActiveValue::Set(self.cipher.encrypt_opt(account.api_key.as_deref())?),
            project_id: ActiveValue::Set(account.project_id),
            tier: ActiveValue::Set(account.tier),
            expires_at: ActiveValue::Set(account.expires_at),
            is_active: ActiveValue::Set(true),
            status: ActiveValue::Set(AccountStatus::Active.as_str().to_string()),
            request_count: ActiveValue::Set(0),
            success_count: ActiveValue::Set(0),
            error_count: ActiveValue::Set(0),
            consecutive_errors: ActiveValue::Set(0),
            last_used_at: ActiveValue::Set(None),
            last_error_at: ActiveValue::Set(None),
            last_error_code: ActiveValue::Set(None),
            last_error_message: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        entities::ProviderAccounts::insert(active)
            .exec(&self.db)
            .await?;
        self.account_by_id(&id)
            .await?
            .ok_or(StorageError::AccountNotFound(id))
    }

    async fn update_credentials(&self, id: &str, update: CredentialUpdate) -> StorageResult<()> {
        use entities::provider_accounts::ActiveModel;
        let model = self.account_model(id).await?;
        let mut active: ActiveModel = model.into();
        if let Some(access_token) = update.access_token.as_deref() {
            active.access_token = ActiveValue::Set(self.cipher.encrypt(access_token)?);
        }
        if let Some(refresh_token) = update.refresh_token.as_deref() {
            active.refresh_token = ActiveValue::Set(self.cipher.encrypt(refresh_token)?);
        }
        if let Some(api_key) = update.api_key.as_deref() {
            active.api_key = ActiveValue::Set(Some(self.cipher.encrypt(api_key)?));
        }
        if update.project_id.is_some() {
            active.project_id = ActiveValue::Set(update.project_id);
        }
        if update.tier.is_some() {
            active.tier = ActiveValue::Set(update.tier);
        }
        if update.expires_at.is_some() {
            active.expires_at = ActiveValue::Set(update.expires_at);
        }
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn touch_account_usage(&self, id: &str) -> StorageResult<()> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(
                Column::RequestCount,
                Expr::col(Column::RequestCount).add(1),
            )
            .col_expr(Column::LastUsedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_success(&self, id: &str) -> StorageResult<()> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(
                Column::SuccessCount,
                Expr::col(Column::SuccessCount).add(1),
            )
            .col_expr(Column::ConsecutiveErrors, Expr::value(0))
            .col_expr(
                Column::Status,
                Expr::value(AccountStatus::Active.as_str()),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, id: &str, failure: FailureRecord) -> StorageResult<i32> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(Column::ErrorCount, Expr::col(Column::ErrorCount).add(1))
            .col_expr(
                Column::ConsecutiveErrors,
                Expr::col(Column::ConsecutiveErrors).add(1),
            )
            .col_expr(Column::LastErrorAt, Expr::value(OffsetDateTime::now_utc()))
            .col_expr(
                Column::LastErrorCode,
                Expr::value(i32::from(failure.status_code)),
            )
            .col_expr(Column::LastErrorMessage, Expr::value(failure.message))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        let model = self.account_model(id).await?;
        Ok(model.consecutive_errors)
    }

    async fn set_account_status(
        &self,
        id: &str,
        status: AccountStatus,
        is_active: bool,
    ) -> StorageResult<()> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::IsActive, Expr::value(is_active))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn rename_account(&self, id: &str, name: &str) -> StorageResult<()> {
        use entities::provider_accounts::ActiveModel;
        let model = self.account_model(id).await?;
        let mut active: ActiveModel = model.into();
        active.name = ActiveValue::Set(Some(name.to_string()));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&self.db).await?;
        Ok(())
    }

    async fn set_account_enabled(&self, id: &str, enabled: bool) -> StorageResult<()> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(Column::IsActive, Expr::value(enabled))
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reset_account_counters(&self, id: &str) -> StorageResult<()> {
        use entities::provider_accounts::Column;
        entities::ProviderAccounts::update_many()
            .col_expr(Column::ErrorCount, Expr::value(0_i64))
            .col_expr(Column::ConsecutiveErrors, Expr::value(0))
            .col_expr(Column::SuccessCount, Expr::value(0_i64))
            .col_expr(Column::RequestCount, Expr::value(0_i64))
            .col_expr(
                Column::Status,
                Expr::value(AccountStatus::Active.as_str()),
            )
            .filter(Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> StorageResult<()> {
        entities::ProviderAccounts::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn accounts_expiring_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> StorageResult<Vec<AccountRow>> {
        use entities::provider_accounts::Column;
        let rows = entities::ProviderAccounts::find()
            .filter(Column::IsActive.eq(true))
            .filter(
                Condition::all()
                    .add(Column::ExpiresAt.is_not_null())
                    .add(Column::ExpiresAt.lt(cutoff)),
            )
            .all(&self.db)
            .await?;
        rows.into_iter().map(|row| self.decrypt_row(row)).collect()
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> StorageResult<Option<ApiKeyRow>> {
        use entities::proxy_api_keys::Column;
        let Some(model) = entities::ProxyApiKeys::find()
            .filter(Column::KeyHash.eq(key_hash))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let models: Vec<String> = serde_json::from_value(model.model_access_list.clone())?;
        let access = match model.model_access_mode.as_str() {
            "allowlist" => ModelAccess::Allowlist(models),
            "denylist" => ModelAccess::Denylist(models),
            _ => ModelAccess::All,
        };
        Ok(Some(ApiKeyRow {
            id: model.id,
            user_id: model.user_id,
            name: model.name,
            access,
        }))
    }

    async fn insert_usage_log(&self, row: NewUsageLog) -> StorageResult<()> {
        use entities::usage_logs::ActiveModel;
        let active = ActiveModel {
            id: ActiveValue::NotSet,
            at: ActiveValue::Set(OffsetDateTime::now_utc()),
            user_id: ActiveValue::Set(row.user_id),
            api_key_id: ActiveValue::Set(row.api_key_id),
            provider_account_id: ActiveValue::Set(row.provider_account_id),
            provider: ActiveValue::Set(row.provider),
            model: ActiveValue::Set(row.model),
            input_tokens: ActiveValue::Set(row.input_tokens),
            output_tokens: ActiveValue::Set(row.output_tokens),
            status_code: ActiveValue::Set(row.status_code),
            duration_ms: ActiveValue::Set(row.duration_ms),
        };
        entities::UsageLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    async fn disabled_models(&self) -> StorageResult<Vec<String>> {
        let rows = entities::DisabledModels::find().all(&self.db).await?;
        Ok(rows.into_iter().map(|row| row.model).collect())
    }
}
