pub mod crypto;
pub mod entities;
pub mod store;

pub use crypto::{FieldCipher, hash_api_key};
pub use store::{
    AccountRow, AccountStatus, AccountStore, ApiKeyRow, CredentialUpdate, FailureRecord,
    ModelAccess, NewAccount, NewUsageLog, SeaOrmStore, StorageError, StorageResult,
};
