use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tracing_subscriber::EnvFilter;

use vac_common::Config;
use vac_coordinator::{
    ExpirySweeper, NodeRegistry, PurchaseService, Reconciler, RetryPolicy, SweepWorker,
};
use vac_store::{EntitlementStore, MemoryStore};

mod handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EntitlementStore>,
    pub registry: Arc<NodeRegistry>,
    pub reconciler: Arc<Reconciler>,
    pub purchase: Arc<PurchaseService>,
    pub node_timeout: Duration,
    /// Plan granted free of charge on first contact, when configured.
    pub trial_plan: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    let node_timeout = Duration::from_millis(config.node_timeout_ms);
    let retry = RetryPolicy {
        attempts: config.node_retry_count,
        base_delay: Duration::from_millis(config.node_retry_delay_ms),
    };

    let store: Arc<dyn EntitlementStore> = Arc::new(MemoryStore::new());
    let registry = Arc::new(NodeRegistry::new());
    registry.connect_from_store(store.as_ref(), node_timeout);

    let reconciler = Arc::new(Reconciler::new(store.clone(), registry.clone(), retry));
    let purchase = Arc::new(PurchaseService::new(store.clone(), reconciler.clone()));

    let expiry_sweeper = Arc::new(ExpirySweeper::new(
        store.clone(),
        reconciler.clone(),
        Duration::from_secs(config.expiry_interval_secs),
    ));
    let sweep_worker = Arc::new(SweepWorker::new(
        store.clone(),
        reconciler.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    ));
    let expiry_handle = expiry_sweeper.start();
    let sweep_handle = sweep_worker.start();

    let state = AppState {
        store,
        registry,
        reconciler,
        purchase,
        node_timeout,
        trial_plan: config.trial_plan.clone(),
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/users", post(handlers::upsert_user))
        .route("/users/:chat_id/credit", post(handlers::credit_user))
        .route(
            "/users/:chat_id/subscriptions",
            get(handlers::user_subscriptions),
        )
        .route("/plans", get(handlers::list_plans).post(handlers::insert_plan))
        .route("/plans/:id/price", post(handlers::set_plan_price))
        .route("/purchase", post(handlers::purchase))
        .route(
            "/servers",
            get(handlers::list_servers).post(handlers::upsert_server),
        )
        .route("/servers/:id/enabled", post(handlers::set_server_enabled))
        .route(
            "/subscriptions/:id/status",
            post(handlers::set_subscription_status),
        )
        .route("/sync/:sub_id", post(handlers::sync_subscription))
        .route("/sweep/:server_id", post(handlers::sweep_server))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("coordinator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    expiry_sweeper.stop();
    sweep_worker.stop();
    let _ = expiry_handle.await;
    let _ = sweep_handle.await;
    Ok(())
}
