use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use cmis_sync::crypto::TokenCipher;
use cmis_sync::platforms::{self, PlatformRegistry};
use cmis_sync::store::{self, ConnectionStore};
use cmis_sync::{api, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmis_sync=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("cmis-sync v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    let cipher = TokenCipher::new(&config.master_key, &config.hmac_secret)?;
    let store = ConnectionStore::new(&config.database_url).await?;
    store.migrate().await?;
    info!("Database connected and migrated");

    let mut registry = PlatformRegistry::new();
    platforms::register_defaults(&mut registry, &config);
    info!("Registered {} ad platforms", registry.count());

    info!(
        "Asset cache: ttl {}s, max {} entries",
        config.asset_cache_ttl_secs, config.asset_cache_max_entries
    );
    let addr = format!("{}:{}", config.host, config.port);
    let state: SharedState = Arc::new(AppState::new(config, store, cipher, registry));

    let daemon_state = state.clone();
    tokio::spawn(async move {
        store::refresh_daemon(daemon_state).await;
    });

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready");
    axum::serve(listener, app).await?;

    Ok(())
}
