//! Custom Resource Definitions for the Talos bootstrap operator
//!
//! This module defines the Kubernetes CRDs that declare machine bootstraps.

mod machine_bootstrap;
pub mod types;


pub use machine_bootstrap::{MachineBootstrap, MachineBootstrapSpec, MachineBootstrapStatus};
pub use types::*;
