//! Shared types for the Talos bootstrap CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase reported in `MachineBootstrap` status
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// Not attempted yet
    #[default]
    Pending,
    /// Retry loop in progress
    Bootstrapping,
    /// The machine API accepted the trigger
    Bootstrapped,
    /// The last create attempt failed; the next pass retries
    Failed,
}

impl std::fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BootstrapPhase::Pending => "Pending",
            BootstrapPhase::Bootstrapping => "Bootstrapping",
            BootstrapPhase::Bootstrapped => "Bootstrapped",
            BootstrapPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Kubernetes-style condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Bootstrapped", "Ready")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation that the condition was set based upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
