mod admission;
mod backend;
mod challenges;
mod config;
mod maintenance;
mod pool;
mod routes;
mod solver;
mod store;
mod task;
mod templates;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::backend::{Browser, WebDriverBrowser};
use crate::challenges::ChallengeProfiles;
use crate::config::ServerConfig;
use crate::maintenance::{spawn_result_sweeper, spawn_tab_recycler, RecycleConfig, SweepConfig};
use crate::pool::TabPool;
use crate::routes::AppState;
use crate::solver::Solver;
use crate::store::ResultStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("solver=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env()?;
    let profiles = Arc::new(ChallengeProfiles::load()?);
    info!(
        "Starting solver service: {} contexts x {} tabs, headless={}",
        config.threads, config.page_count, config.headless
    );

    let browser: Arc<dyn Browser> = Arc::new(WebDriverBrowser::connect(&config).await?);

    // Fill the pool: one fresh context per thread
    let pool = TabPool::new(config.capacity());
    for _ in 0..config.threads {
        let tabs = browser
            .open_tabs(config.page_count)
            .await
            .context("Browser initialization failed")?;
        for tab in tabs {
            pool.put_new(Arc::from(tab));
        }
    }
    info!("Tab pool initialization is complete, including {} tabs", pool.size());

    let store = Arc::new(ResultStore::new());
    let admission = Arc::new(AdmissionController::new(config.capacity()));
    let solver = Solver::new(pool.clone(), store.clone(), profiles.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_result_sweeper(
        store.clone(),
        SweepConfig {
            interval: config.result_sweep_interval,
            retention: config.result_retention,
        },
        shutdown_rx.clone(),
    );
    let recycler = spawn_tab_recycler(
        pool.clone(),
        browser.clone(),
        RecycleConfig {
            interval: config.cleanup_interval,
            delay: config.recycle_delay,
        },
        shutdown_rx,
    );

    let app = routes::router(AppState {
        solver,
        admission,
        store,
        profiles,
        pool: pool.clone(),
    });

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    info!("Start cleaning browser resources");
    let _ = shutdown_tx.send(true);
    for handle in [sweeper, recycler] {
        if let Err(e) = handle.await {
            warn!("Maintenance loop ended abnormally: {}", e);
        }
    }

    for tab in pool.drain() {
        if let Err(e) = tab.close().await {
            warn!("Error closing tab {}: {}", tab.id(), e);
        }
    }
    if let Err(e) = browser.shutdown().await {
        warn!("Exception when closing the browser: {}", e);
    }
    info!("All browser resources have been cleaned");

    Ok(())
}
