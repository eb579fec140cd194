//! Protobuf messages for the machine API bootstrap call
//!
//! Only the subset of `machine.proto` / `common.proto` needed to trigger a
//! bootstrap is declared here. Unknown fields are skipped on decode.

/// Fully qualified gRPC path of the bootstrap RPC
pub const BOOTSTRAP_PATH: &str = "/machine.MachineService/Bootstrap";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BootstrapRequest {
    /// Recover etcd from a previously uploaded snapshot
    #[prost(bool, tag = "1")]
    pub recover_etcd: bool,
    #[prost(bool, tag = "2")]
    pub recover_skip_hash_check: bool,
}

/// Per-node metadata attached by the proxying endpoint
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    #[prost(string, tag = "1")]
    pub hostname: ::prost::alloc::string::String,
    /// Non-empty when the call failed on this node
    #[prost(string, tag = "2")]
    pub error: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bootstrap {
    #[prost(message, optional, tag = "1")]
    pub metadata: ::core::option::Option<Metadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BootstrapResponse {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::prost::alloc::vec::Vec<Bootstrap>,
}

impl BootstrapResponse {
    /// Errors reported by individual nodes behind the proxy, as `(hostname, error)`
    pub fn node_errors(&self) -> Vec<(String, String)> {
        self.messages
            .iter()
            .filter_map(|m| m.metadata.as_ref())
            .filter(|md| !md.error.is_empty())
            .map(|md| (md.hostname.clone(), md.error.clone()))
            .collect()
    }
}
