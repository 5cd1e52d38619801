mod agent_clients;
mod config;
mod error;
mod heartbeat;
mod ingress;
mod instance_config;
mod lifecycle;
mod models;
mod ports;
mod rate_limit;
mod rebuild;
mod reconciler;
mod routes;
mod runtime;
mod store;
#[cfg(test)]
mod testing;

use crate::agent_clients::decision_agent::HttpDecisionAgent;
use crate::config::Config;
use crate::heartbeat::{DailyCostCounter, HeartbeatSupervisor, RestartFailureTracker};
use crate::ingress::NginxIngress;
use crate::instance_config::InstanceStorage;
use crate::lifecycle::LifecycleController;
use crate::models::MIGRATIONS;
use crate::ports::PortAllocator;
use crate::rate_limit::{OwnerRateLimiter, RateLimitConfig};
use crate::rebuild::{RebuildLock, ShellImageBuilder};
use crate::reconciler::Reconciler;
use crate::runtime::docker::{DockerRuntime, DockerRuntimeConfig};
use crate::runtime::ContainerRuntime;
use crate::store::{DbPool, PgInstanceStore};
use anyhow::Context;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use diesel_migrations::MigrationHarness;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct State {
    pub controller: Arc<LifecycleController>,
    pub reconciler: Arc<Reconciler>,
    pub sync_secret: Option<String>,
    pub rate_limiter: Arc<OwnerRateLimiter>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;

    // DB management
    let manager = ConnectionManager::<PgConnection>::new(&config.database_url);
    let db_pool: DbPool = Pool::builder()
        .max_size(10)
        .test_on_check_out(true)
        .build(manager)
        .context("Could not build connection pool")?;

    let mut connection = db_pool.get()?;
    connection
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migrations could not run: {e}"))?;
    info!("Database migrations applied");
    drop(connection);

    let store = Arc::new(PgInstanceStore::new(db_pool.clone()));
    let runtime = Arc::new(DockerRuntime::connect(DockerRuntimeConfig::new(
        config.image.clone(),
        config.data_root.clone(),
    ))?);
    if let Err(e) = runtime.ping().await {
        warn!(error = %e, "docker daemon not reachable at startup");
    }

    let ingress = Arc::new(NginxIngress::new(
        store.clone(),
        config.nginx_port_map_path.clone(),
        config.nginx_reload,
    ));
    let builder = Arc::new(ShellImageBuilder {
        source_dir: config.source_dir.clone(),
        image: config.image.clone(),
        dockerfile: config.dockerfile.clone(),
        sync_timeout: config.source_sync_timeout,
        build_timeout: config.image_build_timeout,
    });
    let controller = LifecycleController::new(
        store.clone(),
        runtime.clone(),
        PortAllocator::new(config.port_range.clone(), config.port_attempts)?,
        RebuildLock::new(config.rebuild_lock_path.clone(), config.rebuild_lock_ttl),
        builder,
        ingress,
        InstanceStorage::new(config.data_root.clone()),
    );
    let reconciler = Arc::new(Reconciler::new(
        store,
        runtime,
        config.reconcile_interval,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconcile_handle = {
        let reconciler = reconciler.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    let heartbeat_handle = match &config.heartbeat {
        Some(heartbeat) => {
            let agent = HttpDecisionAgent::new(
                heartbeat.agent_url.clone(),
                heartbeat.agent_token.clone(),
            )?;
            info!(agent_url = %heartbeat.agent_url, "heartbeat supervisor enabled");
            let supervisor = HeartbeatSupervisor::new(
                Arc::new(agent),
                heartbeat.limits.clone(),
                heartbeat.interval,
                DailyCostCounter::new(
                    heartbeat.max_cost_per_day,
                    chrono::Local::now().date_naive(),
                ),
                RestartFailureTracker::new(heartbeat.give_up_threshold),
            );
            Some(tokio::spawn(supervisor.run(shutdown_rx.clone())))
        }
        None => {
            warn!("heartbeat supervisor not configured");
            None
        }
    };

    if config.sync_secret.is_none() {
        warn!("CLAWDEPLOY_SYNC_SECRET not set, /admin/sync will refuse every call");
    }

    let state = State {
        controller: Arc::new(controller),
        reconciler,
        sync_secret: config.sync_secret.clone(),
        rate_limiter: Arc::new(OwnerRateLimiter::new(RateLimitConfig {
            max_requests: config.create_rate_limit,
            window: config.create_rate_window,
            ..RateLimitConfig::default()
        })),
    };

    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.http_port)
        .parse()
        .context("Failed to parse bind/port for webserver")?;

    let server = axum::Server::bind(&addr).serve(routes::router(state).into_make_service());

    info!("Webserver running on http://{addr}");

    let graceful = server.with_graceful_shutdown(shutdown_signal());

    if let Err(e) = graceful.await {
        error!("Shutdown error: {e}");
    }
    info!("webserver stopped, stopping background loops");
    let _ = shutdown_tx.send(true);

    if let Err(e) = reconcile_handle.await {
        error!("Reconciler task failed: {e}");
    }
    if let Some(handle) = heartbeat_handle {
        if let Err(e) = handle.await {
            error!("Heartbeat task failed: {e}");
        }
    }

    drop(db_pool);
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
