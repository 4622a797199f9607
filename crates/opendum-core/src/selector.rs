use std::sync::Arc;

use opendum_provider::ProviderKind;
use opendum_storage::{AccountRow, AccountStore, StorageError};

use crate::ledger::RateLimitLedger;
use crate::models::ModelEntry;

#[derive(Debug)]
pub enum Selection {
    Account(Box<AccountRow>),
    /// Eligible accounts exist but every untried one is cooling down.
    RateLimited { account_ids: Vec<String> },
    /// No untried eligible accounts at all.
    None,
}

/// Round-robin account picker: least-recently-used first, filtered by
/// ownership, active flag, provider/model support, the tried-set and the
/// rate-limit ledger.
pub struct AccountSelector {
    store: Arc<dyn AccountStore>,
    ledger: Arc<RateLimitLedger>,
}

impl AccountSelector {
    pub fn new(store: Arc<dyn AccountStore>, ledger: Arc<RateLimitLedger>) -> Self {
        Self { store, ledger }
    }

    pub async fn next_available(
        &self,
        user_id: &str,
        model: &ModelEntry,
        provider_hint: Option<ProviderKind>,
        tried: &[String],
    ) -> Result<Selection, StorageError> {
        let mut candidates: Vec<AccountRow> = self
            .store
            .accounts_for_user(user_id)
            .await?
            .into_iter()
            .filter(|account| account.is_active)
            .filter(|account| match ProviderKind::parse(&account.provider) {
                Some(kind) => match provider_hint {
                    Some(hint) => kind == hint && model.supported_by(kind),
                    None => model.supported_by(kind),
                },
                None => false,
            })
            .filter(|account| !tried.contains(&account.id))
            .collect();

        if candidates.is_empty() {
            return Ok(Selection::None);
        }

        // Oldest use first; never-used accounts lead. Ties break by id so
        // the order is stable across instances.
        candidates.sort_by(|a, b| {
            let by_use = match (a.last_used_at, b.last_used_at) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(left), Some(right)) => left.cmp(&right),
            };
            by_use.then_with(|| a.id.cmp(&b.id))
        });

        let mut limited_ids = Vec::new();
        for account in candidates {
            if self
                .ledger
                .is_rate_limited(&account.id, model.family)
                .await
            {
                limited_ids.push(account.id);
                continue;
            }
            return Ok(Selection::Account(Box::new(account)));
        }

        Ok(Selection::RateLimited {
            account_ids: limited_ids,
        })
    }
}
