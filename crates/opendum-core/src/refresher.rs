use std::sync::Arc;
use std::time::{Duration, Instant};

use opendum_provider::CredentialService;
use opendum_storage::AccountStore;
use time::OffsetDateTime;
use tracing::{info, warn};

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(2 * 3600);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub total: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u128,
}

/// Scheduled sweep over accounts whose tokens expire soon. Individual
/// failures are recorded against the account and never halt the pass.
pub struct ProactiveRefresher {
    store: Arc<dyn AccountStore>,
    credentials: Arc<CredentialService>,
    threshold: Duration,
}

impl ProactiveRefresher {
    pub fn new(
        store: Arc<dyn AccountStore>,
        credentials: Arc<CredentialService>,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            credentials,
            threshold,
        }
    }

    pub async fn run_once(&self) -> RefreshSummary {
        let started = Instant::now();
        let cutoff = OffsetDateTime::now_utc()
            + time::Duration::seconds(self.threshold.as_secs() as i64);

        let mut summary = RefreshSummary::default();
        let accounts = match self.store.accounts_expiring_before(cutoff).await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %err, "refresh pass could not list accounts");
                summary.duration_ms = started.elapsed().as_millis();
                return summary;
            }
        };

        summary.total = accounts.len();
        for account in accounts {
            // Only OAuth-backed accounts hold a refresh token.
            if account.refresh_token.trim().is_empty() {
                summary.skipped += 1;
                continue;
            }
            match self.credentials.refresh_account(&account).await {
                Ok(_) => summary.refreshed += 1,
                Err(err) => {
                    warn!(account = %account.id, error = %err, "proactive refresh failed");
                    summary.failed += 1;
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis();
        info!(
            total = summary.total,
            refreshed = summary.refreshed,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms as u64,
            "proactive refresh pass finished"
        );
        summary
    }

    /// Runs forever on `interval`; the first pass fires immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
