//! Reconciles notification contact points in a Grafana alerting backend on
//! behalf of integrations which own lists of datasources.
//!
//! The entry point is [`reconcile::SyncScheduler::schedule`], which enqueues
//! a delayed [`reconcile::ContactPointSyncExecutor`] task and stores the
//! task's id as the authoritative run token for the integration. Overlapping
//! schedule calls for the same integration supersede one another: only the
//! worker holding the most recently stored token acts, and all others no-op.
//! Datasources whose contact point could not be created in a round are
//! re-driven by scheduling a fresh round carrying just the failed subset,
//! until a round converges and the integration is marked setup-complete.

pub mod classify;
pub mod client;
pub mod fencing;
pub mod model;
pub mod reconcile;

pub use reconcile::{ContactPointSyncExecutor, SyncRequest, SyncScheduler};
