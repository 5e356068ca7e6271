//! # VAC Coordinator
//!
//! Control plane for a fleet of proxy nodes: decides who gets access to
//! which node, and keeps every node's credential set converged with the
//! entitlement store.
//!
//! ## Pieces
//!
//! - [`node_client`] — management RPC to one node, retry policy, registry
//! - [`placement`] — capacity-aware server selection for new subscriptions
//! - [`purchase`] — snapshot → placement → store transaction → push
//! - [`reconciler`] — targeted sync and full diff-and-repair sweeps
//! - [`sweeper`] — background expiry of overdue subscriptions
//! - [`sweep_worker`] — background full sweeps across the fleet
//! - [`mock_node`] — in-memory node double with scripted failures
//!
//! The store itself lives in `vac-store`; shared types and errors in
//! `vac-common`.

pub mod mock_node;
pub mod node_client;
pub mod placement;
pub mod purchase;
pub mod reconciler;
pub mod sweep_worker;
pub mod sweeper;

pub use node_client::{HttpNodeClient, NodeHandle, NodeRegistry, RetryPolicy};
pub use placement::select_server;
pub use purchase::{PurchaseError, PurchaseService};
pub use reconciler::{Reconciler, SweepFailure, SweepReport, SyncAction, SyncError};
pub use sweep_worker::SweepWorker;
pub use sweeper::ExpirySweeper;
