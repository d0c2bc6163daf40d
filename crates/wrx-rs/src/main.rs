use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use wrx::{
    adapters::ToolRegistry,
    api::{router, AppState},
    config::AppConfig,
    db,
    jobs::{JobManager, JobStore},
    runner::Runner,
    workspace::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Arc::new(AppConfig::load()?);

    let db_url = config.database_url();
    let state_dir = config.base_dir.join(".wrx");
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("cannot create {}", state_dir.display()))?;
    let pool = db::create_pool(&db_url)
        .await
        .with_context(|| format!("cannot open job database {db_url}"))?;
    db::run_migrations(&pool).await.context("job database migration failed")?;

    let store = Store::new(&config.base_dir);
    for (workspace, run_id) in store.recover_interrupted().context("run recovery failed")? {
        warn!(%workspace, %run_id, "recovered interrupted run");
    }

    let registry = ToolRegistry::system(Duration::from_secs(config.probe_timeout_secs));
    let runner = Arc::new(Runner::new(store, registry, config.missing_tool_policy));
    let jobs = JobManager::start(
        JobStore::new(pool),
        runner,
        config.worker_pool_size,
        config.scope_allowlist.clone(),
    )
    .await
    .context("job subsystem failed to start")?;

    let app = router(AppState {
        jobs,
        config: config.clone(),
    })
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, base_dir = %config.base_dir.display(), workers = config.worker_pool_size, "wrx-rs listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
