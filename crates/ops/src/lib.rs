//! Fleetcheck ops: watch waits, resource reconciliation and leader lookup.
//!
//! Everything here talks to the cluster through a shared
//! [`fleetcheck_kubehub::DispatchTable`]; no component keeps a watch open
//! past the call that opened it.

#![forbid(unsafe_code)]

pub mod leader;
pub mod reconciler;
pub mod waiter;

pub use leader::{LeaderLocator, DEFAULT_LEASE_NAME};
pub use reconciler::{ReconcileState, Reconciliation, ReconcilerConfig, ResourceReconciler};
pub use waiter::{ArmedWait, WatchWaiter};
