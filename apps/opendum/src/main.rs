use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use opendum_core::accounts::AccountOnboarding;
use opendum_core::engine::ProxyEngine;
use opendum_core::ledger::RateLimitLedger;
use opendum_core::refresher::{DEFAULT_INTERVAL, DEFAULT_THRESHOLD, ProactiveRefresher};
use opendum_provider::client::{HttpClient, HttpClientConfig};
use opendum_provider::providers::default_registry;
use opendum_storage::{AccountStore, FieldCipher, SeaOrmStore};
use tracing_subscriber::EnvFilter;

/// Multi-tenant LLM reverse proxy with OAuth account rotation.
#[derive(Debug, Parser)]
#[command(name = "opendum", version)]
struct Args {
    #[arg(long, env = "OPENDUM_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "OPENDUM_PORT", default_value_t = 8787)]
    port: u16,

    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Optional shared rate-limit cache (redis://…). Absent means the
    /// ledger runs on in-process state only.
    #[arg(long, env = "OPENDUM_CACHE_URL")]
    cache_url: Option<String>,

    /// Secret the token-column cipher key is derived from. All
    /// instances sharing one database must agree on it.
    #[arg(long, env = "OPENDUM_ENCRYPTION_KEY")]
    encryption_key: String,

    /// Outbound proxy for upstream traffic.
    #[arg(long, env = "OPENDUM_OUTBOUND_PROXY")]
    outbound_proxy: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let cipher = FieldCipher::from_secret(&args.encryption_key);
    let store = SeaOrmStore::connect(&args.database_url, cipher)
        .await
        .context("database connection failed")?;
    store.schema_sync().await.context("schema sync failed")?;
    let store: Arc<dyn AccountStore> = Arc::new(store);

    let http = HttpClient::new(HttpClientConfig {
        proxy: args.outbound_proxy.clone(),
        ..HttpClientConfig::default()
    })
    .context("http client construction failed")?;
    let registry = Arc::new(default_registry(http.clone()));
    let ledger = Arc::new(RateLimitLedger::connect(args.cache_url.as_deref()).await);

    let engine = Arc::new(ProxyEngine::new(
        store.clone(),
        registry.clone(),
        Arc::new(http),
        ledger,
    ));
    let onboarding = Arc::new(AccountOnboarding::new(registry, store.clone()));

    let refresher = Arc::new(ProactiveRefresher::new(
        store.clone(),
        engine.credentials(),
        DEFAULT_THRESHOLD,
    ));
    let _refresh_task = refresher.spawn(DEFAULT_INTERVAL);

    let state = opendum_router::AppState {
        engine,
        store,
        onboarding,
    };
    let app = axum::Router::new()
        .merge(opendum_router::proxy_router(state.clone()))
        .merge(opendum_router::accounts_router(state));

    let bind = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
