//! Purchase flow.
//!
//! Snapshot → placement → store transaction → best-effort push. The store
//! transaction is the only authoritative step: once it commits, the user owns
//! the subscription even if the push to the node fails (the sweep delivers it
//! later). A placement that loses the race against a concurrent purchase is
//! retried against a fresh snapshot a bounded number of times.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use vac_common::{now_unix, StoreError, Subscription};
use vac_store::{EntitlementStore, PurchaseRequest};

use crate::placement::select_server;
use crate::reconciler::Reconciler;

/// How many stale-snapshot losses one purchase absorbs before giving up.
const PLACEMENT_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum PurchaseError {
    /// No enabled server can take the subscription right now.
    #[error("no server with free capacity")]
    NoCapacity,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct PurchaseService {
    store: Arc<dyn EntitlementStore>,
    reconciler: Arc<Reconciler>,
}

impl PurchaseService {
    pub fn new(store: Arc<dyn EntitlementStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }

    /// Buy `plan_id` for the user behind `chat_id`, creating the user on
    /// first contact.
    pub async fn buy(&self, chat_id: i64, plan_id: &str) -> Result<Subscription, PurchaseError> {
        let user = self.store.upsert_user(chat_id);
        let plan = self.store.get_plan(plan_id)?;

        let mut attempts = 0;
        let sub = loop {
            let snapshot = self.store.capacity_snapshot();
            let server = select_server(&snapshot).map_err(|_| PurchaseError::NoCapacity)?;

            let req = PurchaseRequest {
                user_id: user.id,
                plan_id: plan.id.clone(),
                server_id: server.id.clone(),
                credential: Uuid::new_v4(),
                // admin-supplied durations can be arbitrarily large
                expires_at: now_unix().saturating_add(plan.duration_secs),
            };
            match self.store.purchase(req) {
                Ok(sub) => break sub,
                // snapshot went stale under us; place again from fresh counts
                Err(StoreError::NoCapacity { server_id }) => {
                    attempts += 1;
                    if attempts >= PLACEMENT_RETRIES {
                        warn!(
                            "purchase for chat {} gave up after {} placement races (last: {})",
                            chat_id, attempts, server_id
                        );
                        return Err(PurchaseError::NoCapacity);
                    }
                }
                // astronomically unlikely; regenerate and try again
                Err(StoreError::CredentialCollision) => {}
                Err(other) => return Err(other.into()),
            }
        };

        info!(
            "purchase committed: chat={} plan={} server={} sub={}",
            chat_id, sub.plan_id, sub.server_id, sub.id
        );

        // push is best-effort; the subscription stands either way
        if let Err(err) = self.reconciler.trigger_sync(sub.id).await {
            warn!(
                "post-purchase push for {} failed, sweep will deliver it: {}",
                sub.id, err
            );
        }
        Ok(sub)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
