//! Machine API client factory
//!
//! Decodes the credential blob, resolves which endpoints to dial and hands a
//! scoped, authenticated connection to a single operation.

pub mod config;
pub mod endpoint;
mod factory;
pub mod grpc;
pub mod proto;

pub use config::{ClientConfig, ClientCredentials, CredentialDecoder, TalosConfigDecoder};
pub use endpoint::{endpoint_uri, resolve_endpoints, DEFAULT_MACHINE_API_PORT};
pub use factory::{ClientFactory, ConnectionTarget, Connector, MachineConnection};
pub use grpc::GrpcConnector;
pub use proto::BootstrapRequest;

#[cfg(test)]
pub(crate) use factory::tests::FakeConnector;
