//! HTTP handlers for the coordinator control API.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/health` | GET | Liveness probe |
//! | `/users` | POST | First-contact user upsert (grants the trial plan when configured) |
//! | `/users/{chat_id}/credit` | POST | Credit a user's balance |
//! | `/users/{chat_id}/subscriptions` | GET | Subscriptions of one user |
//! | `/plans` | GET | List plans |
//! | `/plans` | POST | Insert a plan |
//! | `/plans/{id}/price` | POST | Reprice a plan |
//! | `/purchase` | POST | Buy a plan (placement + debit + push) |
//! | `/servers` | POST | Register or update a server |
//! | `/servers` | GET | Servers with their active counts |
//! | `/servers/{id}/enabled` | POST | Enable / disable a server |
//! | `/subscriptions/{id}/status` | POST | Administrative cancel / ban, pushed to the node |
//! | `/sync/{subscription_id}` | POST | Push one subscription to its node |
//! | `/sweep/{server_id}` | POST | Full diff-and-repair sweep of one node |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use vac_common::{Server, StoreError, SubscriptionStatus};
use vac_coordinator::{PurchaseError, SweepReport, SyncError};

// AppState is defined in main.rs (parent module when included via `mod handlers;`)
use super::AppState;

// ════════════════════════════════════════════════════════════════════════════
// REQUEST/RESPONSE TYPES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct UpsertUserReq {
    pub chat_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditReq {
    pub amount: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InsertPlanReq {
    pub id: String,
    pub name: String,
    pub price: i64,
    pub bandwidth_limit_mbps: u32,
    pub tier: String,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPriceReq {
    pub price: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseReq {
    pub chat_id: i64,
    pub plan_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetEnabledReq {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetStatusReq {
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResp {
    pub server_id: String,
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
    pub failed: Vec<SweepFailureResp>,
    pub converged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailureResp {
    pub credential: Uuid,
    pub action: String,
    pub error: String,
}

impl From<SweepReport> for SweepResp {
    fn from(report: SweepReport) -> Self {
        let converged = report.converged();
        Self {
            server_id: report.server_id,
            added: report.added,
            removed: report.removed,
            failed: report
                .failed
                .into_iter()
                .map(|f| SweepFailureResp {
                    credential: f.credential,
                    action: f.action.to_string(),
                    error: f.error,
                })
                .collect(),
            converged,
        }
    }
}

fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::UserNotFound
        | StoreError::PlanNotFound(_)
        | StoreError::ServerNotFound(_)
        | StoreError::SubscriptionNotFound => StatusCode::NOT_FOUND,
        StoreError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        StoreError::NoCapacity { .. } => StatusCode::CONFLICT,
        StoreError::CredentialCollision => StatusCode::CONFLICT,
    }
}

fn error_body(err: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "error": err.to_string() }))
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn upsert_user(
    State(state): State<AppState>,
    Json(payload): Json<UpsertUserReq>,
) -> Json<Value> {
    let first_contact = state.store.get_user_by_chat(payload.chat_id).is_none();
    let user = state.store.upsert_user(payload.chat_id);

    // first contact earns the trial subscription, when one is configured;
    // it goes through the normal purchase path (placement, capacity guard)
    let mut trial = None;
    if first_contact {
        if let Some(plan_id) = &state.trial_plan {
            match state.purchase.buy(payload.chat_id, plan_id).await {
                Ok(sub) => trial = Some(sub),
                Err(err) => tracing::warn!(
                    "trial grant for chat {} failed: {}",
                    payload.chat_id,
                    err
                ),
            }
        }
    }
    Json(json!({ "user": user, "trial": trial }))
}

pub async fn credit_user(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
    Json(payload): Json<CreditReq>,
) -> (StatusCode, Json<Value>) {
    let Some(user) = state.store.get_user_by_chat(chat_id) else {
        return (StatusCode::NOT_FOUND, error_body(StoreError::UserNotFound));
    };
    match state.store.credit_balance(user.id, payload.amount) {
        Ok(balance) => (StatusCode::OK, Json(json!({ "balance": balance }))),
        Err(err) => (store_error_status(&err), error_body(err)),
    }
}

pub async fn user_subscriptions(
    State(state): State<AppState>,
    Path(chat_id): Path<i64>,
) -> (StatusCode, Json<Value>) {
    let Some(user) = state.store.get_user_by_chat(chat_id) else {
        return (StatusCode::NOT_FOUND, error_body(StoreError::UserNotFound));
    };
    let subs = state.store.subscriptions_for_user(user.id);
    (StatusCode::OK, Json(json!(subs)))
}

pub async fn list_plans(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.store.list_plans()))
}

pub async fn insert_plan(
    State(state): State<AppState>,
    Json(payload): Json<InsertPlanReq>,
) -> Json<Value> {
    state.store.insert_plan(vac_common::Plan {
        id: payload.id,
        name: payload.name,
        price: payload.price,
        bandwidth_limit_mbps: payload.bandwidth_limit_mbps,
        tier: payload.tier,
        duration_secs: payload.duration_secs,
    });
    Json(json!({ "ok": true }))
}

pub async fn set_plan_price(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SetPriceReq>,
) -> (StatusCode, Json<Value>) {
    match state.store.set_plan_price(&id, payload.price) {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(err) => (store_error_status(&err), error_body(err)),
    }
}

pub async fn purchase(
    State(state): State<AppState>,
    Json(payload): Json<PurchaseReq>,
) -> (StatusCode, Json<Value>) {
    match state.purchase.buy(payload.chat_id, &payload.plan_id).await {
        Ok(sub) => (StatusCode::OK, Json(json!(sub))),
        Err(PurchaseError::NoCapacity) => (
            StatusCode::CONFLICT,
            error_body(PurchaseError::NoCapacity),
        ),
        Err(PurchaseError::Store(err)) => (store_error_status(&err), error_body(err)),
    }
}

pub async fn upsert_server(
    State(state): State<AppState>,
    Json(payload): Json<Server>,
) -> Json<Value> {
    let id = payload.id.clone();
    state.store.upsert_server(payload);
    // (re)build the management handle so syncs reach the node immediately
    state
        .registry
        .connect_from_store(state.store.as_ref(), state.node_timeout);
    Json(json!({ "ok": true, "id": id }))
}

pub async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    let loads: Vec<Value> = state
        .store
        .list_servers()
        .into_iter()
        .map(|server| {
            let active = state.store.active_count(&server.id).unwrap_or(0);
            json!({
                "id": server.id,
                "addr": server.addr,
                "max_users": server.max_users,
                "enabled": server.enabled,
                "active": active,
            })
        })
        .collect();
    Json(json!(loads))
}

pub async fn set_server_enabled(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SetEnabledReq>,
) -> (StatusCode, Json<Value>) {
    match state.store.set_server_enabled(&id, payload.enabled) {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(err) => (store_error_status(&err), error_body(err)),
    }
}

pub async fn set_subscription_status(
    State(state): State<AppState>,
    Path(sub_id): Path<Uuid>,
    Json(payload): Json<SetStatusReq>,
) -> (StatusCode, Json<Value>) {
    if let Err(err) = state.store.set_status(sub_id, payload.status) {
        return (store_error_status(&err), error_body(err));
    }
    // push is best-effort, same as the expiry path; the sweep heals a miss
    if let Err(err) = state.reconciler.trigger_sync(sub_id).await {
        tracing::warn!("status push for {} failed: {}", sub_id, err);
    }
    (StatusCode::OK, Json(json!({ "ok": true })))
}

pub async fn sync_subscription(
    State(state): State<AppState>,
    Path(sub_id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    match state.reconciler.trigger_sync(sub_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(SyncError::Store(err)) => (store_error_status(&err), error_body(err)),
        Err(err @ SyncError::UnknownServer(_)) => (StatusCode::NOT_FOUND, error_body(err)),
        Err(err @ SyncError::Node(_)) => (StatusCode::BAD_GATEWAY, error_body(err)),
    }
}

pub async fn sweep_server(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.reconciler.run_full_sweep(&server_id).await {
        Ok(report) => (StatusCode::OK, Json(json!(SweepResp::from(report)))),
        Err(SyncError::Store(err)) => (store_error_status(&err), error_body(err)),
        Err(err @ SyncError::UnknownServer(_)) => (StatusCode::NOT_FOUND, error_body(err)),
        Err(err @ SyncError::Node(_)) => (StatusCode::BAD_GATEWAY, error_body(err)),
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use vac_common::Plan;
    use vac_coordinator::mock_node::MockNode;
    use vac_coordinator::{NodeRegistry, PurchaseService, Reconciler, RetryPolicy};
    use vac_store::{EntitlementStore, MemoryStore};

    fn plan(id: &str, price: i64, duration_secs: u64) -> Plan {
        Plan {
            id: id.to_string(),
            name: id.to_string(),
            price,
            bandwidth_limit_mbps: 50,
            tier: format!("tier-{}", id),
            duration_secs,
        }
    }

    fn app_state(trial_plan: Option<&str>) -> (AppState, Arc<MockNode>) {
        let store: Arc<dyn EntitlementStore> = Arc::new(MemoryStore::new());
        store.upsert_server(Server {
            id: "srv-1".to_string(),
            addr: "srv-1.example.net:443".to_string(),
            mgmt_url: String::new(),
            mgmt_secret: "secret".to_string(),
            routing_key: "pubkey".to_string(),
            max_users: 10,
            enabled: true,
        });
        let node = Arc::new(MockNode::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.register("srv-1", node.clone());
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            registry.clone(),
            RetryPolicy {
                attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        ));
        let purchase = Arc::new(PurchaseService::new(store.clone(), reconciler.clone()));
        let state = AppState {
            store,
            registry,
            reconciler,
            purchase,
            node_timeout: Duration::from_secs(1),
            trial_plan: trial_plan.map(|s| s.to_string()),
        };
        (state, node)
    }

    #[tokio::test]
    async fn test_status_endpoint_revokes_live_subscription() {
        let (state, node) = app_state(None);
        state.store.insert_plan(plan("basic", 100, 3600));
        let user = state.store.upsert_user(42);
        state.store.credit_balance(user.id, 100).unwrap();
        let sub = state.purchase.buy(42, "basic").await.unwrap();
        assert!(node.contains(sub.credential));

        let (status, _) = set_subscription_status(
            State(state.clone()),
            Path(sub.id),
            Json(SetStatusReq {
                status: SubscriptionStatus::Cancelled,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.store.get_subscription(sub.id).unwrap().status,
            SubscriptionStatus::Cancelled
        );
        // the revocation reached the node without waiting for a sweep
        assert!(!node.contains(sub.credential));
    }

    #[tokio::test]
    async fn test_status_endpoint_ban_and_unknown_id() {
        let (state, node) = app_state(None);
        state.store.insert_plan(plan("basic", 100, 3600));
        let user = state.store.upsert_user(1);
        state.store.credit_balance(user.id, 100).unwrap();
        let sub = state.purchase.buy(1, "basic").await.unwrap();

        let (status, _) = set_subscription_status(
            State(state.clone()),
            Path(sub.id),
            Json(SetStatusReq {
                status: SubscriptionStatus::Banned,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!node.contains(sub.credential));

        let (status, _) = set_subscription_status(
            State(state.clone()),
            Path(Uuid::new_v4()),
            Json(SetStatusReq {
                status: SubscriptionStatus::Cancelled,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_first_contact_grants_trial() {
        let (state, node) = app_state(Some("trial"));
        state.store.insert_plan(plan("trial", 0, 600));

        upsert_user(State(state.clone()), Json(UpsertUserReq { chat_id: 7 })).await;

        let user = state.store.get_user_by_chat(7).unwrap();
        let subs = state.store.subscriptions_for_user(user.id);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].plan_id, "trial");
        assert_eq!(subs[0].status, SubscriptionStatus::Active);
        assert!(node.contains(subs[0].credential));
        // the trial is time-boxed by its plan, not open-ended
        assert!(subs[0].expires_at <= vac_common::now_unix() + 600);

        // repeat contact does not grant another one
        upsert_user(State(state.clone()), Json(UpsertUserReq { chat_id: 7 })).await;
        assert_eq!(state.store.subscriptions_for_user(user.id).len(), 1);
    }

    #[tokio::test]
    async fn test_no_trial_when_unconfigured() {
        let (state, _node) = app_state(None);
        state.store.insert_plan(plan("trial", 0, 600));
        upsert_user(State(state.clone()), Json(UpsertUserReq { chat_id: 7 })).await;
        let user = state.store.get_user_by_chat(7).unwrap();
        assert!(state.store.subscriptions_for_user(user.id).is_empty());
    }

    #[tokio::test]
    async fn test_trial_failure_still_creates_user() {
        // trial plan configured but never inserted into the catalog
        let (state, _node) = app_state(Some("trial"));
        upsert_user(State(state.clone()), Json(UpsertUserReq { chat_id: 9 })).await;
        let user = state.store.get_user_by_chat(9).unwrap();
        assert!(state.store.subscriptions_for_user(user.id).is_empty());
    }
}
