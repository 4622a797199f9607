pub mod disabled_models;
pub mod provider_accounts;
pub mod proxy_api_keys;
pub mod usage_logs;

pub use disabled_models::Entity as DisabledModels;
pub use provider_accounts::Entity as ProviderAccounts;
pub use proxy_api_keys::Entity as ProxyApiKeys;
pub use usage_logs::Entity as UsageLogs;
