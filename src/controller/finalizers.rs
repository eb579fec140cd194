//! Finalizer handling for MachineBootstrap cleanup
//!
//! Bootstrapping cannot be undone, so cleanup only forgets the recorded
//! identity. The finalizer still guarantees that step runs before the
//! object disappears.

use kube::ResourceExt;

use crate::crd::MachineBootstrap;

/// Finalizer name used to protect MachineBootstrap resources
pub const MACHINE_BOOTSTRAP_FINALIZER: &str = "machinebootstrap.talos.dev/finalizer";

/// Check if the resource is being deleted
pub fn is_being_deleted(mb: &MachineBootstrap) -> bool {
    mb.metadata.deletion_timestamp.is_some()
}

/// Check if the resource has our finalizer
pub fn has_finalizer(mb: &MachineBootstrap) -> bool {
    mb.finalizers()
        .iter()
        .any(|f| f == MACHINE_BOOTSTRAP_FINALIZER)
}
