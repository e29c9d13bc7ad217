//! Background maintenance loops
//!
//! - Result sweeper: drops terminal results nobody collected
//! - Tab recycler: replaces every pooled tab with one from a fresh context
//!
//! Both loops stop when the shutdown channel flips to `true`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Browser;
use crate::pool::TabPool;
use crate::store::ResultStore;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Age after which a terminal result is dropped
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct RecycleConfig {
    /// Time between recycling passes
    pub interval: Duration,
    /// Pause after each replaced tab
    pub delay: Duration,
}

/// Outcome of one recycling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycleSummary {
    pub recycled: usize,
    pub total: usize,
}

/// Sleep for `interval` unless shutdown comes first; true means stop
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, interval: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(interval) => false,
    }
}

pub fn spawn_result_sweeper(
    store: Arc<ResultStore>,
    config: SweepConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Result sweeper started (interval: {}s, retention: {}s)",
            config.interval.as_secs(),
            config.retention.as_secs()
        );
        loop {
            if wait_or_shutdown(&mut shutdown_rx, config.interval).await {
                info!("Result sweeper shutting down");
                break;
            }
            let evicted = store.evict_stale(config.retention);
            for id in &evicted {
                debug!("Clean up expired task: {}", id);
            }
            if !evicted.is_empty() {
                info!(
                    "Evicted {} expired results, {} remaining",
                    evicted.len(),
                    store.len()
                );
            }
        }
    })
}

/// Replace the `pool.size()` tabs present when the pass starts, one at a time
///
/// Each tab is taken out of the pool, closed, and replaced by a tab opened
/// in a fresh context. Replacements handed back by `acquire` during the pass
/// are held aside so the pass waits for the older, busy tabs instead. A
/// failed recreation costs the pool that slot.
pub async fn recycle_tabs(pool: &TabPool, browser: &dyn Browser, delay: Duration) -> RecycleSummary {
    let total = pool.size();
    let mut recycled = 0;
    let mut attempted = 0;
    let mut fresh_ids = HashSet::new();
    let mut held_aside = Vec::new();

    while attempted < total {
        let tab = match pool.acquire().await {
            Ok(tab) if fresh_ids.contains(tab.id()) => {
                held_aside.push(tab);
                continue;
            }
            Ok(tab) => tab.retire(),
            Err(e) => {
                warn!("Stopping tab recycling: {}", e);
                break;
            }
        };
        attempted += 1;

        if let Err(e) = tab.close().await {
            warn!("Error closing tab {}: {}", tab.id(), e);
        }

        match browser.open_tabs(1).await {
            Ok(tabs) if !tabs.is_empty() => {
                for fresh in tabs {
                    fresh_ids.insert(fresh.id().to_string());
                    pool.put_new(Arc::from(fresh));
                }
                recycled += 1;
            }
            Ok(_) => warn!("Failed to rebuild tab {}: backend opened no tab", tab.id()),
            Err(e) => warn!("Failed to rebuild tab {}: {}", tab.id(), e),
        }

        tokio::time::sleep(delay).await;
    }

    drop(held_aside);
    RecycleSummary { recycled, total }
}

pub fn spawn_tab_recycler(
    pool: TabPool,
    browser: Arc<dyn Browser>,
    config: RecycleConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Tab recycler started (interval: {}s)",
            config.interval.as_secs()
        );
        loop {
            if wait_or_shutdown(&mut shutdown_rx, config.interval).await {
                info!("Tab recycler shutting down");
                break;
            }

            info!("Start recycling tabs and contexts one by one");
            tokio::select! {
                summary = recycle_tabs(&pool, browser.as_ref(), config.delay) => {
                    info!(
                        "Regular cleaning is completed, a total of {}/{} tabs",
                        summary.recycled, summary.total
                    );
                }
                _ = shutdown_rx.changed() => {
                    info!("Tab recycler interrupted by shutdown");
                    break;
                }
            }
        }
    })
}
