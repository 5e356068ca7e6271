//! # VAC Common Crate
//!
//! Shared foundation for the VAC control plane: domain types, the error
//! taxonomy used across crate boundaries, and runtime configuration.
//!
//! ## Modules
//! - `types`: users, plans, servers, subscriptions
//! - `error`: node / store / placement error contracts
//! - `config`: environment-driven coordinator configuration

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, ConfigError};
pub use error::{NodeError, PlacementError, StoreError};
pub use types::{
    now_unix, Plan, Server, ServerLoad, Subscription, SubscriptionStatus, User,
};
