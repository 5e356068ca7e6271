//! # VAC Entitlement Store
//!
//! Durable record of users, plans, servers and subscriptions — the source of
//! truth for "who should have access to what, until when". The coordinator
//! consumes it exclusively through the [`EntitlementStore`] trait; the
//! bundled [`MemoryStore`] keeps everything behind one lock so the purchase
//! transaction and the capacity snapshot are genuinely atomic. A relational
//! implementation would plug in at the same trait boundary.
//!
//! ## Invariants enforced here
//!
//! - `credential` is unique system-wide (prevents node-side collisions).
//! - `purchase` debits balance, re-checks capacity and inserts the
//!   subscription as one transaction; a failed guard leaves no trace.
//! - `mark_expired_if_active` only transitions subscriptions that are still
//!   `Active` (conditional update, safe to re-run).
//! - Deleting a user cascades to its subscriptions.

use std::collections::HashSet;
use uuid::Uuid;

use vac_common::{Plan, Server, ServerLoad, StoreError, Subscription, SubscriptionStatus, User};

pub mod memory;

pub use memory::MemoryStore;

/// Parameters of one purchase transaction.
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub user_id: Uuid,
    pub plan_id: String,
    pub server_id: String,
    /// Freshly generated credential identifier; the store rejects collisions.
    pub credential: Uuid,
    pub expires_at: u64,
}

/// Store interface consumed by the coordinator.
///
/// All methods are synchronous; implementations are expected to answer from
/// local state or a connection pool with their own internal timeouts.
pub trait EntitlementStore: Send + Sync + 'static {
    // ── users ──────────────────────────────────────────────────────────────

    /// Create the user on first contact, or touch `updated_at` on repeat.
    fn upsert_user(&self, chat_id: i64) -> User;
    fn get_user(&self, id: Uuid) -> Result<User, StoreError>;
    fn get_user_by_chat(&self, chat_id: i64) -> Option<User>;
    /// Add to the user's balance (deposit watcher callback).
    fn credit_balance(&self, user_id: Uuid, amount: i64) -> Result<i64, StoreError>;
    /// Delete the user and cascade to its subscriptions.
    fn remove_user(&self, user_id: Uuid) -> Result<(), StoreError>;

    // ── plans ──────────────────────────────────────────────────────────────

    fn insert_plan(&self, plan: Plan);
    fn get_plan(&self, id: &str) -> Result<Plan, StoreError>;
    fn list_plans(&self) -> Vec<Plan>;
    /// Pricing is the only mutable plan attribute.
    fn set_plan_price(&self, id: &str, price: i64) -> Result<(), StoreError>;

    // ── servers ────────────────────────────────────────────────────────────

    fn upsert_server(&self, server: Server);
    fn get_server(&self, id: &str) -> Result<Server, StoreError>;
    fn list_servers(&self) -> Vec<Server>;
    fn set_server_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError>;

    // ── capacity ───────────────────────────────────────────────────────────

    /// Count of `Active` subscriptions assigned to one server.
    fn active_count(&self, server_id: &str) -> Result<u32, StoreError>;
    /// Enabled servers with their active counts, read under one lock so the
    /// placement selector sees a consistent view.
    fn capacity_snapshot(&self) -> Vec<ServerLoad>;

    // ── subscriptions ──────────────────────────────────────────────────────

    /// Atomic purchase: balance debit + capacity re-check + insert.
    fn purchase(&self, req: PurchaseRequest) -> Result<Subscription, StoreError>;
    /// Conditional transition `Active` → `Expired`. Returns `true` only when
    /// this call performed the transition.
    fn mark_expired_if_active(&self, sub_id: Uuid) -> Result<bool, StoreError>;
    /// Administrative transition (cancel / ban).
    fn set_status(&self, sub_id: Uuid, status: SubscriptionStatus) -> Result<(), StoreError>;
    /// `Active` subscriptions whose expiry timestamp has passed at `now`.
    fn expired_candidates(&self, now: u64) -> Vec<Subscription>;
    fn get_subscription(&self, id: Uuid) -> Result<Subscription, StoreError>;
    fn subscriptions_for_user(&self, user_id: Uuid) -> Vec<Subscription>;

    // ── reconciliation reads ───────────────────────────────────────────────

    /// Desired entitlement set for one server: credentials of `Active`
    /// subscriptions assigned to it. Computed on demand, never persisted.
    fn desired_set(&self, server_id: &str) -> Result<HashSet<Uuid>, StoreError>;
    /// `Active` subscriptions assigned to one server, sorted by credential
    /// so sweep operations run in a stable order.
    fn active_subscriptions(&self, server_id: &str) -> Result<Vec<Subscription>, StoreError>;
}
