//! gRPC transport to the Talos machine API
//!
//! Connections use mutual TLS with the CA and client identity carried by the
//! credential. Endpoints are dialed in order and the first reachable one is
//! used; the target nodes travel as `nodes` request metadata so the endpoint
//! proxies the call to them.

use std::time::Duration;

use async_trait::async_trait;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

use super::config::ClientCredentials;
use super::endpoint::endpoint_uri;
use super::factory::{ConnectionTarget, Connector, MachineConnection};
use super::proto::{BootstrapRequest, BootstrapResponse, BOOTSTRAP_PATH};
use crate::error::{Error, Result};

/// Connects to the machine API over gRPC
#[derive(Clone, Debug)]
pub struct GrpcConnector {
    /// Per-endpoint dial timeout
    pub connect_timeout: Duration,
    /// Per-request timeout for unary calls
    pub request_timeout: Duration,
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

fn tls_config(credentials: &ClientCredentials) -> ClientTlsConfig {
    let identity = Identity::from_pem(&credentials.cert_pem, &credentials.key_pem);
    let ca_cert = Certificate::from_pem(&credentials.ca_pem);

    ClientTlsConfig::new()
        .identity(identity)
        .ca_certificate(ca_cert)
}

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MachineConnection>> {
        let tls = tls_config(&target.credentials);
        let mut failures = Vec::with_capacity(target.endpoints.len());

        for address in &target.endpoints {
            let uri = endpoint_uri(address);

            let endpoint = Endpoint::from_shared(uri.clone())
                .map_err(|e| Error::ConfigError(format!("invalid endpoint {address:?}: {e}")))?
                .connect_timeout(self.connect_timeout)
                .timeout(self.request_timeout)
                .tls_config(tls.clone())
                .map_err(|e| Error::ConfigError(format!("TLS setup for {uri} failed: {e}")))?;

            debug!("Dialing machine API at {}", uri);

            match endpoint.connect().await {
                Ok(channel) => {
                    info!("Connected to machine API at {}", uri);
                    return Ok(Box::new(GrpcMachineConnection {
                        channel,
                        endpoint: uri,
                        nodes: target.nodes.clone(),
                    }));
                }
                Err(e) => {
                    warn!("Machine API at {} unreachable: {}", uri, e);
                    failures.push(format!("{uri}: {e}"));
                }
            }
        }

        Err(Error::ConnectionError {
            endpoints: target.endpoints.join(", "),
            message: if failures.is_empty() {
                "no endpoints to dial".to_string()
            } else {
                failures.join("; ")
            },
        })
    }
}

/// A channel to one machine API endpoint
pub struct GrpcMachineConnection {
    channel: Channel,
    endpoint: String,
    nodes: Vec<String>,
}

impl GrpcMachineConnection {
    fn remote_error(&self, message: impl Into<String>) -> Error {
        Error::RemoteCallError {
            endpoint: self.endpoint.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl MachineConnection for GrpcMachineConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn bootstrap(&mut self, request: BootstrapRequest) -> Result<()> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| Error::ConnectionError {
            endpoints: self.endpoint.clone(),
            message: format!("channel not ready: {e}"),
        })?;

        let mut request = tonic::Request::new(request);
        for node in &self.nodes {
            let value = AsciiMetadataValue::try_from(node.as_str())
                .map_err(|e| Error::ValidationError(format!("invalid node {node:?}: {e}")))?;
            request.metadata_mut().append("nodes", value);
        }

        let codec: ProstCodec<BootstrapRequest, BootstrapResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(BOOTSTRAP_PATH);

        let response = grpc
            .unary(request, path, codec)
            .await
            .map_err(|status| {
                self.remote_error(format!("{:?}: {}", status.code(), status.message()))
            })?
            .into_inner();

        let node_errors = response.node_errors();
        if !node_errors.is_empty() {
            let message = node_errors
                .into_iter()
                .map(|(host, err)| format!("{host}: {err}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(self.remote_error(message));
        }

        debug!("Bootstrap accepted by {} for {:?}", self.endpoint, self.nodes);
        Ok(())
    }

    async fn close(self: Box<Self>) {
        debug!("Closing machine API connection to {}", self.endpoint);
        drop(self.channel);
    }
}
