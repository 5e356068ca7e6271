//! Credential reconciliation.
//!
//! The store is the source of truth; node credential sets are a projection
//! of it. Two paths keep them converged:
//!
//! - [`Reconciler::trigger_sync`] pushes one subscription's state right after
//!   it changes (purchase, expiry, cancel). Best-effort: a failed push is
//!   logged and left for the next sweep.
//! - [`Reconciler::run_full_sweep`] diffs the desired set against what the
//!   node reports and repairs the difference. Adds run before removes so a
//!   paying user is never cut off to make room for bookkeeping.
//!
//! Per-id failures during a sweep do not abort it: the rest of the diff is
//! still applied and the failures come back in the [`SweepReport`]. Only a
//! failure to list the node's actual set aborts, since without it there is
//! no diff to apply.
//!
//! Operations against one server are serialized through a per-server async
//! mutex; different servers reconcile concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use vac_common::{NodeError, Plan, StoreError, Subscription};
use vac_store::EntitlementStore;

use crate::node_client::{with_retry, NodeRegistry, RetryPolicy};

// ════════════════════════════════════════════════════════════════════════════
// REPORT TYPES
// ════════════════════════════════════════════════════════════════════════════

/// Direction of one reconciliation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Add,
    Remove,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncAction::Add => write!(f, "add"),
            SyncAction::Remove => write!(f, "remove"),
        }
    }
}

/// One credential the sweep could not repair after exhausting retries.
#[derive(Debug, Clone)]
pub struct SweepFailure {
    pub credential: Uuid,
    pub action: SyncAction,
    /// Display form of the cause, node-side or store-side.
    pub error: String,
}

/// Outcome of one full sweep against one server.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub server_id: String,
    /// Credentials loaded onto the node by this sweep.
    pub added: Vec<Uuid>,
    /// Credentials unloaded from the node by this sweep.
    pub removed: Vec<Uuid>,
    /// Repairs that failed; the next sweep will pick them up again.
    pub failed: Vec<SweepFailure>,
}

impl SweepReport {
    /// Node matched the desired set when this sweep finished.
    pub fn converged(&self) -> bool {
        self.failed.is_empty()
    }

    /// Whether the sweep found anything to repair at all.
    pub fn drift_detected(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.failed.is_empty()
    }
}

/// Reconciliation failure that prevented the operation from running at all.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No management handle registered for the subscription's server.
    #[error("no management handle for server {0}")]
    UnknownServer(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Node interaction failed after retries in a way that blocked the whole
    /// operation (e.g. the actual-set listing).
    #[error(transparent)]
    Node(#[from] NodeError),
}

// ════════════════════════════════════════════════════════════════════════════
// RECONCILER
// ════════════════════════════════════════════════════════════════════════════

pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    registry: Arc<NodeRegistry>,
    retry: RetryPolicy,
    /// One async mutex per server id, created lazily. Serializes syncs and
    /// sweeps against the same node; distinct nodes proceed in parallel.
    server_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        registry: Arc<NodeRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            server_locks: Mutex::new(HashMap::new()),
        }
    }

    fn server_lock(&self, server_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.server_locks
            .lock()
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    fn label_for(sub: &Subscription) -> String {
        format!("sub-{}", sub.id)
    }

    /// Push one subscription's current state to its node.
    ///
    /// Entitled → add the credential; anything else → remove it. Safe to call
    /// again for the same subscription: both node operations are idempotent.
    pub async fn trigger_sync(&self, sub_id: Uuid) -> Result<(), SyncError> {
        let sub = self.store.get_subscription(sub_id)?;
        let handle = self
            .registry
            .get(&sub.server_id)
            .ok_or_else(|| SyncError::UnknownServer(sub.server_id.clone()))?;

        let lock = self.server_lock(&sub.server_id);
        let _guard = lock.lock().await;

        if sub.status.is_entitled() {
            let plan = self.store.get_plan(&sub.plan_id)?;
            let label = Self::label_for(&sub);
            with_retry(self.retry, || {
                handle.add_credential(sub.credential, &plan.tier, &label)
            })
            .await?;
            info!(
                "synced subscription {}: credential {} added on {}",
                sub.id, sub.credential, sub.server_id
            );
        } else {
            with_retry(self.retry, || handle.remove_credential(sub.credential)).await?;
            info!(
                "synced subscription {} ({}): credential {} removed from {}",
                sub.id, sub.status, sub.credential, sub.server_id
            );
        }
        Ok(())
    }

    /// Diff one node against the store and repair the difference.
    pub async fn run_full_sweep(&self, server_id: &str) -> Result<SweepReport, SyncError> {
        let handle = self
            .registry
            .get(server_id)
            .ok_or_else(|| SyncError::UnknownServer(server_id.to_string()))?;

        let lock = self.server_lock(server_id);
        let _guard = lock.lock().await;

        // also validates the server id against the store
        let desired_subs = self.store.active_subscriptions(server_id)?;
        let desired: HashSet<Uuid> = desired_subs.iter().map(|s| s.credential).collect();

        let actual = with_retry(self.retry, || handle.list_credentials()).await?;

        let mut report = SweepReport {
            server_id: server_id.to_string(),
            added: Vec::new(),
            removed: Vec::new(),
            failed: Vec::new(),
        };

        // adds first: entitled users come online before anything is torn down
        let mut plans: HashMap<String, Plan> = HashMap::new();
        for sub in desired_subs.iter().filter(|s| !actual.contains(&s.credential)) {
            let plan = match plans.get(&sub.plan_id) {
                Some(plan) => plan.clone(),
                None => match self.store.get_plan(&sub.plan_id) {
                    Ok(plan) => {
                        plans.insert(sub.plan_id.clone(), plan.clone());
                        plan
                    }
                    // one dangling plan reference must not stall the rest
                    Err(error) => {
                        warn!(
                            "sweep {}: add {} blocked: {}",
                            server_id, sub.credential, error
                        );
                        report.failed.push(SweepFailure {
                            credential: sub.credential,
                            action: SyncAction::Add,
                            error: error.to_string(),
                        });
                        continue;
                    }
                },
            };
            let label = Self::label_for(sub);
            match with_retry(self.retry, || {
                handle.add_credential(sub.credential, &plan.tier, &label)
            })
            .await
            {
                Ok(()) => report.added.push(sub.credential),
                Err(error) => {
                    warn!(
                        "sweep {}: add {} failed: {}",
                        server_id, sub.credential, error
                    );
                    report.failed.push(SweepFailure {
                        credential: sub.credential,
                        action: SyncAction::Add,
                        error: error.to_string(),
                    });
                }
            }
        }

        let mut to_remove: Vec<Uuid> = actual.difference(&desired).copied().collect();
        to_remove.sort();
        for credential in to_remove {
            match with_retry(self.retry, || handle.remove_credential(credential)).await {
                Ok(()) => report.removed.push(credential),
                Err(error) => {
                    warn!("sweep {}: remove {} failed: {}", server_id, credential, error);
                    report.failed.push(SweepFailure {
                        credential,
                        action: SyncAction::Remove,
                        error: error.to_string(),
                    });
                }
            }
        }

        if report.drift_detected() {
            info!(
                "sweep {}: +{} -{} failed {}",
                server_id,
                report.added.len(),
                report.removed.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use vac_common::{now_unix, Plan, Server, ServerLoad, SubscriptionStatus, User};
    use vac_store::{MemoryStore, PurchaseRequest};

    use crate::mock_node::MockNode;
    use crate::node_client::NodeHandle;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        }
    }

    fn test_plan() -> Plan {
        Plan {
            id: "basic".to_string(),
            name: "Basic".to_string(),
            price: 100,
            bandwidth_limit_mbps: 50,
            tier: "tier-basic".to_string(),
            duration_secs: 3600,
        }
    }

    fn test_server(id: &str) -> Server {
        Server {
            id: id.to_string(),
            addr: format!("{}.example.net:443", id),
            mgmt_url: String::new(),
            mgmt_secret: "secret".to_string(),
            routing_key: "pubkey".to_string(),
            max_users: 10,
            enabled: true,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        node: Arc<MockNode>,
        reconciler: Reconciler,
    }

    fn fixture(server_id: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.insert_plan(test_plan());
        store.upsert_server(test_server(server_id));
        let node = Arc::new(MockNode::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.register(server_id, node.clone());
        let reconciler = Reconciler::new(store.clone(), registry, fast_retry());
        Fixture {
            store,
            node,
            reconciler,
        }
    }

    fn buy(fx: &Fixture, server_id: &str) -> Subscription {
        let user = fx.store.upsert_user(1);
        fx.store.credit_balance(user.id, 100).unwrap();
        fx.store
            .purchase(PurchaseRequest {
                user_id: user.id,
                plan_id: "basic".to_string(),
                server_id: server_id.to_string(),
                credential: Uuid::new_v4(),
                expires_at: now_unix() + 3600,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_sync_pushes_active_credential() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        assert!(fx.node.contains(sub.credential));
    }

    #[tokio::test]
    async fn test_trigger_sync_removes_after_expiry() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        fx.store.mark_expired_if_active(sub.id).unwrap();
        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        assert!(!fx.node.contains(sub.credential));
    }

    #[tokio::test]
    async fn test_trigger_sync_unknown_server() {
        let store = Arc::new(MemoryStore::new());
        store.insert_plan(test_plan());
        store.upsert_server(test_server("srv-1"));
        let registry = Arc::new(NodeRegistry::new());
        let reconciler = Reconciler::new(store.clone(), registry, fast_retry());

        let user = store.upsert_user(1);
        store.credit_balance(user.id, 100).unwrap();
        let sub = store
            .purchase(PurchaseRequest {
                user_id: user.id,
                plan_id: "basic".to_string(),
                server_id: "srv-1".to_string(),
                credential: Uuid::new_v4(),
                expires_at: now_unix() + 3600,
            })
            .unwrap();

        let err = reconciler.trigger_sync(sub.id).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownServer(id) if id == "srv-1"));
    }

    #[tokio::test]
    async fn test_sweep_repairs_both_directions() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        // node holds a stray credential and misses the real one
        let stray = Uuid::new_v4();
        fx.node.add_credential(stray, "t", "l").await.unwrap();

        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert!(report.converged());
        assert_eq!(report.added, vec![sub.credential]);
        assert_eq!(report.removed, vec![stray]);
        assert!(fx.node.contains(sub.credential));
        assert!(!fx.node.contains(stray));
    }

    #[tokio::test]
    async fn test_sweep_idempotent_when_converged() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        let adds_before = fx.node.add_calls();

        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert!(report.converged());
        assert!(!report.drift_detected());
        assert_eq!(fx.node.add_calls(), adds_before);
        assert!(fx.node.contains(sub.credential));
    }

    #[tokio::test]
    async fn test_sweep_partial_failure_still_applies_rest() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        let stray = Uuid::new_v4();
        fx.node.add_credential(stray, "t", "l").await.unwrap();

        // exhaust the retry budget (2 attempts) for the single add
        fx.node
            .fail_add(NodeError::Unreachable("down".to_string()), 2);

        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert!(!report.converged());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].credential, sub.credential);
        assert_eq!(report.failed[0].action, SyncAction::Add);
        // the removal on the other side of the diff still ran
        assert_eq!(report.removed, vec![stray]);
        assert!(!fx.node.contains(stray));

        // next sweep heals the add
        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert!(report.converged());
        assert!(fx.node.contains(sub.credential));
    }

    #[tokio::test]
    async fn test_sweep_retries_transient_add() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        // one transient failure, inside the 2-attempt budget
        fx.node
            .fail_add(NodeError::Unreachable("blip".to_string()), 1);

        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert!(report.converged());
        assert_eq!(report.added, vec![sub.credential]);
        assert_eq!(fx.node.add_calls(), 2);
    }

    #[tokio::test]
    async fn test_expiry_removal_retries_then_succeeds() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        fx.store.mark_expired_if_active(sub.id).unwrap();
        // one transient failure, inside the 2-attempt budget
        fx.node
            .fail_remove(NodeError::Unreachable("blip".to_string()), 1);

        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        assert!(!fx.node.contains(sub.credential));
        assert_eq!(fx.node.remove_calls(), 2);
    }

    #[tokio::test]
    async fn test_sweep_aborts_when_listing_fails() {
        let fx = fixture("srv-1");
        buy(&fx, "srv-1");
        fx.node
            .fail_list(NodeError::Unreachable("down".to_string()), 2);

        let err = fx.reconciler.run_full_sweep("srv-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Node(NodeError::Unreachable(_))));
        // nothing was pushed blind
        assert_eq!(fx.node.add_calls(), 0);
    }

    #[tokio::test]
    async fn test_sweep_auth_failure_not_retried() {
        let fx = fixture("srv-1");
        buy(&fx, "srv-1");
        fx.node.fail_list(NodeError::AuthFailed, 1);

        let err = fx.reconciler.run_full_sweep("srv-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Node(NodeError::AuthFailed)));
        assert_eq!(fx.node.list_calls(), 1);
    }

    /// Delegates to a real store but answers `PlanNotFound` for one plan id,
    /// simulating a subscription whose plan row has gone missing.
    struct MissingPlanStore {
        inner: Arc<MemoryStore>,
        missing: String,
    }

    impl EntitlementStore for MissingPlanStore {
        fn upsert_user(&self, chat_id: i64) -> User {
            self.inner.upsert_user(chat_id)
        }
        fn get_user(&self, id: Uuid) -> Result<User, StoreError> {
            self.inner.get_user(id)
        }
        fn get_user_by_chat(&self, chat_id: i64) -> Option<User> {
            self.inner.get_user_by_chat(chat_id)
        }
        fn credit_balance(&self, user_id: Uuid, amount: i64) -> Result<i64, StoreError> {
            self.inner.credit_balance(user_id, amount)
        }
        fn remove_user(&self, user_id: Uuid) -> Result<(), StoreError> {
            self.inner.remove_user(user_id)
        }
        fn insert_plan(&self, plan: Plan) {
            self.inner.insert_plan(plan)
        }
        fn get_plan(&self, id: &str) -> Result<Plan, StoreError> {
            if id == self.missing {
                return Err(StoreError::PlanNotFound(id.to_string()));
            }
            self.inner.get_plan(id)
        }
        fn list_plans(&self) -> Vec<Plan> {
            self.inner.list_plans()
        }
        fn set_plan_price(&self, id: &str, price: i64) -> Result<(), StoreError> {
            self.inner.set_plan_price(id, price)
        }
        fn upsert_server(&self, server: Server) {
            self.inner.upsert_server(server)
        }
        fn get_server(&self, id: &str) -> Result<Server, StoreError> {
            self.inner.get_server(id)
        }
        fn list_servers(&self) -> Vec<Server> {
            self.inner.list_servers()
        }
        fn set_server_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
            self.inner.set_server_enabled(id, enabled)
        }
        fn active_count(&self, server_id: &str) -> Result<u32, StoreError> {
            self.inner.active_count(server_id)
        }
        fn capacity_snapshot(&self) -> Vec<ServerLoad> {
            self.inner.capacity_snapshot()
        }
        fn purchase(&self, req: PurchaseRequest) -> Result<Subscription, StoreError> {
            self.inner.purchase(req)
        }
        fn mark_expired_if_active(&self, sub_id: Uuid) -> Result<bool, StoreError> {
            self.inner.mark_expired_if_active(sub_id)
        }
        fn set_status(&self, sub_id: Uuid, status: SubscriptionStatus) -> Result<(), StoreError> {
            self.inner.set_status(sub_id, status)
        }
        fn expired_candidates(&self, now: u64) -> Vec<Subscription> {
            self.inner.expired_candidates(now)
        }
        fn get_subscription(&self, id: Uuid) -> Result<Subscription, StoreError> {
            self.inner.get_subscription(id)
        }
        fn subscriptions_for_user(&self, user_id: Uuid) -> Vec<Subscription> {
            self.inner.subscriptions_for_user(user_id)
        }
        fn desired_set(&self, server_id: &str) -> Result<HashSet<Uuid>, StoreError> {
            self.inner.desired_set(server_id)
        }
        fn active_subscriptions(&self, server_id: &str) -> Result<Vec<Subscription>, StoreError> {
            self.inner.active_subscriptions(server_id)
        }
    }

    #[tokio::test]
    async fn test_missing_plan_fails_one_id_not_the_sweep() {
        let inner = Arc::new(MemoryStore::new());
        inner.insert_plan(test_plan());
        let mut ghost = test_plan();
        ghost.id = "ghost".to_string();
        inner.insert_plan(ghost);
        inner.upsert_server(test_server("srv-1"));

        let user = inner.upsert_user(1);
        inner.credit_balance(user.id, 200).unwrap();
        let buy_on = |plan_id: &str| {
            inner
                .purchase(PurchaseRequest {
                    user_id: user.id,
                    plan_id: plan_id.to_string(),
                    server_id: "srv-1".to_string(),
                    credential: Uuid::new_v4(),
                    expires_at: now_unix() + 3600,
                })
                .unwrap()
        };
        let sound = buy_on("basic");
        let dangling = buy_on("ghost");

        // the plan row disappears under the second subscription
        let store = Arc::new(MissingPlanStore {
            inner: inner.clone(),
            missing: "ghost".to_string(),
        });
        let node = Arc::new(MockNode::new());
        let stray = Uuid::new_v4();
        node.add_credential(stray, "t", "l").await.unwrap();
        let registry = Arc::new(NodeRegistry::new());
        registry.register("srv-1", node.clone());
        let reconciler = Reconciler::new(store, registry, fast_retry());

        let report = reconciler.run_full_sweep("srv-1").await.unwrap();
        // the healthy add and the removal both went through
        assert_eq!(report.added, vec![sound.credential]);
        assert_eq!(report.removed, vec![stray]);
        assert!(node.contains(sound.credential));
        assert!(!node.contains(stray));
        // the dangling one is reported, not swallowed
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].credential, dangling.credential);
        assert_eq!(report.failed[0].action, SyncAction::Add);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_swept_off_node() {
        let fx = fixture("srv-1");
        let sub = buy(&fx, "srv-1");
        fx.reconciler.trigger_sync(sub.id).await.unwrap();
        fx.store
            .set_status(sub.id, SubscriptionStatus::Cancelled)
            .unwrap();

        let report = fx.reconciler.run_full_sweep("srv-1").await.unwrap();
        assert_eq!(report.removed, vec![sub.credential]);
        assert!(!fx.node.contains(sub.credential));
    }
}
