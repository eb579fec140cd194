//! Controller module for MachineBootstrap reconciliation
//! This module contains the bootstrap lifecycle, its bounded retry loop
//! and the kube-rs controller that drives both.

pub mod conditions;
mod finalizers;
pub mod lifecycle;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
pub mod retry;

pub use finalizers::MACHINE_BOOTSTRAP_FINALIZER;
pub use lifecycle::{
    BootstrapDeclaration, BootstrapReconciler, DeclarationFingerprint, Diagnostic,
    ResourceLifecycle, ResourceState, Severity, BOOTSTRAP_ID,
};
pub use reconciler::{run_controller, ControllerState, UnpersistedBootstraps, CONTROLLER_NAME};
pub use retry::{RetryPolicy, DEFAULT_CREATE_TIMEOUT};
