//! Desired-state reconciliation.
//!
//! The `Reconciler` compares each refresh of desired specs with the monitors
//! it already runs and creates, consolidates or refreshes them. A separate
//! sweep tears down monitors whose specs stopped arriving.

/// Runs reconciliation passes and the stale sweep.
pub mod reconciler;
/// Active-monitor and liveness registries.
pub mod registry;

pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use registry::{ActiveEntry, ActiveRegistry, LivenessKey, LivenessRegistry, LIVENESS_SEPARATOR};
