//! Expiry sweeper.
//!
//! Background loop that flips overdue `Active` subscriptions to `Expired`
//! and pushes the removal to the owning node. The status flip is the
//! authoritative part; the push is best-effort and the full sweep heals any
//! push that fails here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use vac_common::now_unix;
use vac_store::EntitlementStore;

use crate::reconciler::Reconciler;

pub struct ExpirySweeper {
    store: Arc<dyn EntitlementStore>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: Notify,
}

impl ExpirySweeper {
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

    /// Spawn the loop. Ticks are skipped, not bunched, when a pass overruns
    /// the interval, so passes never overlap.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!("expiry sweeper started (interval {:?})", this.interval);
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.run_once().await;
                    }
                    _ = this.shutdown.notified() => {
                        info!("expiry sweeper stopped");
                        return;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// One expiry pass. Returns how many subscriptions this pass expired.
    pub async fn run_once(&self) -> usize {
        let now = now_unix();
        let due = self.store.expired_candidates(now);
        if due.is_empty() {
            debug!("expiry pass: nothing due at {}", now);
            return 0;
        }

        let mut expired = 0;
        for sub in due {
            // conditional flip: a concurrent cancel or earlier pass wins
            match self.store.mark_expired_if_active(sub.id) {
                Ok(true) => {
                    expired += 1;
                    info!("subscription {} expired (was due {})", sub.id, sub.expires_at);
                    if let Err(err) = self.reconciler.trigger_sync(sub.id).await {
                        warn!(
                            "expiry push for {} failed, next sweep will remove it: {}",
                            sub.id, err
                        );
                    }
                }
                Ok(false) => {}
                Err(err) => warn!("expiry flip for {} failed: {}", sub.id, err),
            }
        }
        expired
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
