//! Error contracts shared across the control plane.
//!
//! Three seams, three enums:
//!
//! | Enum | Seam | Retry policy |
//! |------|------|--------------|
//! | [`NodeError`] | management RPC to one proxy node | `Unreachable` retried, `AuthFailed` fatal |
//! | [`StoreError`] | entitlement store operations | never retried, surfaced typed |
//! | [`PlacementError`] | placement selection | surfaced to the purchase flow |
//!
//! A partial sweep failure is deliberately NOT an error variant: a sweep that
//! fails on some ids still succeeds on the rest, so the reconciler reports it
//! through its sweep report instead of aborting.

use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════
// NODE ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure talking to one proxy node's management API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    /// The node could not be contacted within the bounded timeout.
    /// Transient; retried with backoff.
    #[error("node unreachable: {0}")]
    Unreachable(String),

    /// The node rejected the management secret. Fatal for that node;
    /// never retried, surfaced to operators immediately.
    #[error("node rejected management secret")]
    AuthFailed,

    /// The node answered with something outside the management contract.
    #[error("unexpected node response: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Whether the retry loop is allowed to try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Unreachable(_))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORE ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure of an entitlement store operation.
///
/// `InsufficientBalance` and `NoCapacity` are the two conditional-update
/// guards of the purchase transaction; both leave the store untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Balance debit guard failed.
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Capacity guard failed: the server is at or above its ceiling.
    #[error("server {server_id} has no remaining capacity")]
    NoCapacity { server_id: String },

    #[error("user not found")]
    UserNotFound,

    #[error("plan {0} not found")]
    PlanNotFound(String),

    #[error("server {0} not found")]
    ServerNotFound(String),

    #[error("subscription not found")]
    SubscriptionNotFound,

    /// The generated credential identifier already exists somewhere in the
    /// system. Uniqueness is enforced store-wide to prevent node-side
    /// collisions across users and servers.
    #[error("credential identifier collision")]
    CredentialCollision,
}

// ════════════════════════════════════════════════════════════════════════════
// PLACEMENT ERROR
// ════════════════════════════════════════════════════════════════════════════

/// Failure to place a new subscription on any node.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No enabled server has free capacity. The caller must not create a
    /// subscription in this case.
    #[error("no server with free capacity")]
    NoCapacity,
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
