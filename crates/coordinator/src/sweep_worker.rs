//! Periodic full-sweep worker.
//!
//! Walks every enabled server on an interval and runs a full reconciliation
//! sweep against each, fanning out across servers with a `JoinSet` (the
//! per-server lock inside the reconciler keeps each node serialized).
//! Disabled servers are left alone: their node state is frozen, not purged.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use vac_store::EntitlementStore;

use crate::reconciler::{Reconciler, SweepReport};

pub struct SweepWorker {
    store: Arc<dyn EntitlementStore>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: Notify,
}

impl SweepWorker {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        reconciler: Arc<Reconciler>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            interval,
            shutdown: Notify::new(),
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!("sweep worker started (interval {:?})", this.interval);
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.sweep_all().await;
                    }
                    _ = this.shutdown.notified() => {
                        info!("sweep worker stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Sweep every enabled server once, concurrently. Reports come back
    /// sorted by server id; a server whose sweep errored out entirely (e.g.
    /// unreachable for listing) is logged and omitted.
    pub async fn sweep_all(&self) -> Vec<SweepReport> {
        let mut set = JoinSet::new();
        for server in self.store.list_servers().into_iter().filter(|s| s.enabled) {
            let reconciler = self.reconciler.clone();
            set.spawn(async move {
                match reconciler.run_full_sweep(&server.id).await {
                    Ok(report) => Some(report),
                    Err(err) => {
                        warn!("sweep of {} failed: {}", server.id, err);
                        None
                    }
                }
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(err) => warn!("sweep task panicked: {}", err),
            }
        }
        reports.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        reports
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
