use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::config::AppConfig;
use crate::store::SessionStore;
use crate::sync::{HttpTransport, SyncEngine, SyncOutcome};

/// Open (or create) the local database and build the session store on it.
pub async fn connect_store(db_path: &str) -> anyhow::Result<SessionStore> {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    SessionStore::new(pool).await
}

fn build_engine(store: Arc<SessionStore>, config: &AppConfig) -> anyhow::Result<SyncEngine> {
    let transport = Arc::new(HttpTransport::new(
        &config.sync.endpoint,
        config.sync.request_timeout_secs,
    )?);
    Ok(SyncEngine::new(store, transport))
}

/// Run the daemon: periodic sync passes until ctrl-c.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    // 1. Session store
    let store = Arc::new(connect_store(&config.state.db_path).await?);
    info!("Session store initialized ({})", config.state.db_path);

    // 2. Sync engine
    let engine = Arc::new(build_engine(Arc::clone(&store), &config)?);
    info!(
        endpoint = %config.sync.endpoint,
        interval_secs = config.sync.interval_secs,
        "Sync engine configured"
    );

    // 3. Periodic trigger. The engine's own guard coalesces overlapping
    // passes, so the loop just fires and lets the outcome speak in the logs.
    let tick = Duration::from_secs(config.sync.interval_secs);
    let engine_for_loop = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;
            engine_for_loop.run_sync().await;
        }
    });

    info!("Starting hydra-sync v{}", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Ok(())
}

/// Run a single sync pass and return its outcome (the `sync-once` command).
pub async fn sync_once(config: AppConfig) -> anyhow::Result<SyncOutcome> {
    let store = Arc::new(connect_store(&config.state.db_path).await?);
    let engine = build_engine(store, &config)?;
    Ok(engine.run_sync().await)
}
