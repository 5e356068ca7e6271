//! Node management client.
//!
//! Isolates all RPC interaction with one proxy node behind [`NodeHandle`].
//! The live implementation talks HTTP to the node agent's management API;
//! tests plug in [`crate::mock_node::MockNode`] at the same seam.
//!
//! ## Contract
//!
//! - `list_credentials` fails `Unreachable` when the node cannot be reached
//!   within the bounded timeout and `AuthFailed` when the secret is rejected.
//! - `add_credential` is idempotent: a node-side "already exists" answer is
//!   success, not failure.
//! - `remove_credential` is idempotent: a node-side "not found" answer is
//!   success, not failure.
//!
//! Retry policy lives in [`with_retry`], not in the handle itself: only
//! `Unreachable` is retried, with bounded exponential backoff.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use vac_common::{NodeError, Server};
use vac_store::EntitlementStore;

/// Default management endpoint when a server row carries no explicit URL.
pub const DEFAULT_MGMT_URL: &str = "http://127.0.0.1:8686";

// ════════════════════════════════════════════════════════════════════════════
// NODE HANDLE TRAIT
// ════════════════════════════════════════════════════════════════════════════

/// Management surface of one proxy node.
#[async_trait]
pub trait NodeHandle: Send + Sync {
    /// Credentials the node currently has loaded.
    async fn list_credentials(&self) -> Result<HashSet<Uuid>, NodeError>;

    /// Load a credential. Adding an already-present id succeeds.
    async fn add_credential(&self, id: Uuid, tier: &str, label: &str) -> Result<(), NodeError>;

    /// Unload a credential. Removing an absent id succeeds.
    async fn remove_credential(&self, id: Uuid) -> Result<(), NodeError>;
}

// ════════════════════════════════════════════════════════════════════════════
// RETRY
// ════════════════════════════════════════════════════════════════════════════

/// Bounded exponential backoff for node operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never zero.
    pub attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Run `op` under `policy`, retrying only retryable errors.
///
/// `AuthFailed` and `Protocol` surface immediately; `Unreachable` is retried
/// until the attempt budget is spent.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, NodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(
                    "node op failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt, attempts, delay, err
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HTTP CLIENT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct AddUserReq<'a> {
    uuid: Uuid,
    tier: &'a str,
    label: &'a str,
}

#[derive(Deserialize)]
struct ListUsersResp {
    uuids: Vec<Uuid>,
}

/// [`NodeHandle`] over the node agent's HTTP management API.
///
/// Endpoints: `GET /mgmt/users`, `POST /mgmt/users`,
/// `DELETE /mgmt/users/{uuid}`. Authenticated with the per-node secret in
/// the `X-Node-Secret` header.
pub struct HttpNodeClient {
    client: reqwest::Client,
    base: String,
    secret: String,
}

impl HttpNodeClient {
    pub fn new(base: impl Into<String>, secret: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base: base.into(),
            secret: secret.into(),
        }
    }

    /// Build a client for one server row.
    pub fn for_server(server: &Server, timeout: Duration) -> Self {
        let base = if server.mgmt_url.is_empty() {
            DEFAULT_MGMT_URL.to_string()
        } else {
            server.mgmt_url.clone()
        };
        Self::new(base, server.mgmt_secret.clone(), timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    fn transport_error(err: reqwest::Error) -> NodeError {
        NodeError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl NodeHandle for HttpNodeClient {
    async fn list_credentials(&self) -> Result<HashSet<Uuid>, NodeError> {
        let resp = self
            .client
            .get(self.url("/mgmt/users"))
            .header("X-Node-Secret", &self.secret)
            .send()
            .await
            .map_err(Self::transport_error)?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NodeError::AuthFailed),
            status if status.is_success() => {
                let body: ListUsersResp = resp
                    .json()
                    .await
                    .map_err(|e| NodeError::Protocol(format!("list body: {}", e)))?;
                Ok(body.uuids.into_iter().collect())
            }
            status => Err(NodeError::Protocol(format!("list returned {}", status))),
        }
    }

    async fn add_credential(&self, id: Uuid, tier: &str, label: &str) -> Result<(), NodeError> {
        let resp = self
            .client
            .post(self.url("/mgmt/users"))
            .header("X-Node-Secret", &self.secret)
            .json(&AddUserReq { uuid: id, tier, label })
            .send()
            .await
            .map_err(Self::transport_error)?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NodeError::AuthFailed),
            // already loaded on the node: idempotent success
            StatusCode::CONFLICT => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(NodeError::Protocol(format!("add returned {}", status))),
        }
    }

    async fn remove_credential(&self, id: Uuid) -> Result<(), NodeError> {
        let resp = self
            .client
            .delete(self.url(&format!("/mgmt/users/{}", id)))
            .header("X-Node-Secret", &self.secret)
            .send()
            .await
            .map_err(Self::transport_error)?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NodeError::AuthFailed),
            // never loaded or already gone: idempotent success
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(NodeError::Protocol(format!("remove returned {}", status))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODE REGISTRY
// ════════════════════════════════════════════════════════════════════════════

/// Server id → management handle.
///
/// The reconciler resolves handles here; tests register mocks at the same
/// place the binary registers HTTP clients.
pub struct NodeRegistry {
    handles: RwLock<HashMap<String, Arc<dyn NodeHandle>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, server_id: impl Into<String>, handle: Arc<dyn NodeHandle>) {
        self.handles.write().insert(server_id.into(), handle);
    }

    pub fn get(&self, server_id: &str) -> Option<Arc<dyn NodeHandle>> {
        self.handles.read().get(server_id).cloned()
    }

    pub fn remove(&self, server_id: &str) {
        self.handles.write().remove(server_id);
    }

    /// Build HTTP handles for every server currently in the store.
    /// Existing entries are replaced, so this doubles as a refresh.
    pub fn connect_from_store(&self, store: &dyn EntitlementStore, timeout: Duration) {
        for server in store.list_servers() {
            let client = HttpNodeClient::for_server(&server, timeout);
            self.register(server.id.clone(), Arc::new(client));
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
