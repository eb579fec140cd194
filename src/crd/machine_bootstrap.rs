//! MachineBootstrap Custom Resource Definition
//!
//! A MachineBootstrap asks the operator to trigger the one-time Talos
//! cluster bootstrap on a node. Once the machine API has accepted the
//! trigger, `status.bootstrapId` is set and later reconciles are no-ops.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BootstrapPhase, Condition};
use crate::controller::lifecycle::{BootstrapDeclaration, DeclarationFingerprint};

#[derive(CustomResource, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "talos.dev",
    version = "v1alpha1",
    kind = "MachineBootstrap",
    namespaced,
    status = "MachineBootstrapStatus",
    shortname = "mb",
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".spec.node"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrapSpec {
    /// Node to bootstrap. Changing it replaces the resource.
    pub node: String,

    /// Machine API endpoints. Empty means use the talosconfig's endpoints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,

    /// Talos client configuration used for authentication. Changing it replaces the resource.
    pub talos_config: String,

    /// Overrides the operator's create timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_timeout_seconds: Option<u64>,
}

impl std::fmt::Debug for MachineBootstrapSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineBootstrapSpec")
            .field("node", &self.node)
            .field("endpoints", &self.endpoints)
            .field("talos_config", &"<redacted>")
            .field("create_timeout_seconds", &self.create_timeout_seconds)
            .finish()
    }
}

impl MachineBootstrapSpec {
    pub fn declaration(&self) -> BootstrapDeclaration {
        BootstrapDeclaration::new(
            self.node.clone(),
            self.endpoints.clone(),
            self.talos_config.clone(),
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrapStatus {
    #[serde(default)]
    pub phase: BootstrapPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Resource identity; present once the bootstrap call was accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_id: Option<String>,

    /// Node the recorded bootstrap was issued against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_node: Option<String>,

    /// SHA-256 of the talosconfig the recorded bootstrap was issued with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_config_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MachineBootstrapStatus {
    /// Fingerprint of the declaration the recorded bootstrap came from
    pub fn applied_fingerprint(&self) -> Option<DeclarationFingerprint> {
        match (&self.applied_node, &self.applied_config_hash) {
            (Some(node), Some(hash)) => Some(DeclarationFingerprint {
                node: node.clone(),
                credential_sha256: hash.clone(),
            }),
            _ => None,
        }
    }
}
