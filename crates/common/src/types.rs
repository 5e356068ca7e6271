//! Domain types for the VAC control plane.
//!
//! The store is the source of truth for all of these records. Nodes never
//! see anything beyond the credential identifier, the tier label, and a
//! display label — everything else stays on the control plane side.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ════════════════════════════════════════════════════════════════════════════
// SUBSCRIPTION STATUS
// ════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a subscription.
///
/// A subscription is created `Active` at purchase. The expiry sweeper moves
/// it to `Expired` once its expiry timestamp passes; `Cancelled` and `Banned`
/// are administrative transitions. Only `Active` subscriptions contribute to
/// a node's desired entitlement set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
    Banned,
}

impl SubscriptionStatus {
    /// Whether this status entitles the credential to be loaded on a node.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Banned => "banned",
        };
        write!(f, "{}", s)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// ENTITIES
// ════════════════════════════════════════════════════════════════════════════

/// A paying user, anchored to an external chat identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// External chat id; unique across users.
    pub chat_id: i64,
    /// Balance in the smallest currency unit.
    pub balance: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A catalog plan (tariff). Immutable after creation except `price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Price in the smallest currency unit.
    pub price: i64,
    pub bandwidth_limit_mbps: u32,
    /// Node-level tier label, used to configure rate limiting on the node.
    pub tier: String,
    /// Subscription length granted by one purchase, in seconds.
    pub duration_secs: u64,
}

/// A proxy node as known to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    /// Public address clients connect to.
    pub addr: String,
    /// Management RPC endpoint of the node agent.
    pub mgmt_url: String,
    /// Shared secret authenticating management calls.
    pub mgmt_secret: String,
    /// Public routing key material handed out to clients.
    pub routing_key: String,
    /// Hard capacity ceiling: placement never assigns past this.
    pub max_users: u32,
    pub enabled: bool,
}

/// One server together with its current active subscription count.
///
/// Produced by the store under a single lock so that placement sees a
/// consistent view of the whole fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub server: Server,
    pub active: u32,
}

/// Binds one user to one plan on one server.
///
/// `credential` is the entitlement key pushed to the node; it is unique
/// system-wide. The server assignment is fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub server_id: String,
    pub credential: Uuid,
    pub status: SubscriptionStatus,
    /// Unix seconds after which the subscription is no longer entitled.
    pub expires_at: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Subscription {
    /// Whether the expiry timestamp has passed at `now`.
    pub fn is_past_due(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
