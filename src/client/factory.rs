//! Scoped machine API connections
//!
//! [`ClientFactory::with_client`] decodes the credential, resolves endpoints,
//! opens one connection for the duration of a single operation and closes it
//! again on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, instrument, warn};

use super::config::{ClientConfig, ClientCredentials, CredentialDecoder, TalosConfigDecoder};
use super::endpoint::resolve_endpoints;
use super::grpc::GrpcConnector;
use super::proto::BootstrapRequest;
use crate::error::{Error, Result};

/// Everything a [`Connector`] needs to dial the machine API
#[derive(Clone, Debug)]
pub struct ConnectionTarget {
    /// Candidate endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Nodes the endpoint should proxy calls to
    pub nodes: Vec<String>,
    pub credentials: ClientCredentials,
}

/// A live, authenticated connection to one machine API endpoint
#[async_trait]
pub trait MachineConnection: Send {
    /// Endpoint this connection is bound to
    fn endpoint(&self) -> &str;

    /// Trigger the one-time cluster bootstrap on the target nodes
    async fn bootstrap(&mut self, request: BootstrapRequest) -> Result<()>;

    /// Release the connection
    async fn close(self: Box<Self>);
}

/// Opens connections to the machine API
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MachineConnection>>;
}

/// Builds scoped connections from a credential blob
#[derive(Clone)]
pub struct ClientFactory {
    decoder: Arc<dyn CredentialDecoder>,
    connector: Arc<dyn Connector>,
}

impl Default for ClientFactory {
    fn default() -> Self {
        Self::new(
            Arc::new(TalosConfigDecoder::default()),
            Arc::new(GrpcConnector::default()),
        )
    }
}

impl ClientFactory {
    pub fn new(decoder: Arc<dyn CredentialDecoder>, connector: Arc<dyn Connector>) -> Self {
        Self { decoder, connector }
    }

    /// Decode a credential without connecting anywhere
    pub fn validate_credential(&self, credential: &str) -> Result<ClientConfig> {
        self.decoder.decode(credential)
    }

    /// Run `operation` against a connection scoped to `target_nodes`
    ///
    /// Fails with `ConfigError` when the credential cannot be decoded and with
    /// `ConnectionError` when no endpoint is reachable. Errors returned by
    /// `operation` keep their variant and gain the endpoint they happened on.
    #[instrument(skip(self, credential, operation))]
    pub async fn with_client<T, F>(
        &self,
        endpoints: &[String],
        target_nodes: &[String],
        credential: &str,
        operation: F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut dyn MachineConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        if target_nodes.is_empty() {
            return Err(Error::ValidationError(
                "at least one target node is required".to_string(),
            ));
        }

        let config = self.decoder.decode(credential)?;
        let endpoints = resolve_endpoints(endpoints, &config, target_nodes);

        debug!(
            "Connecting to machine API via {:?} (context {})",
            endpoints, config.context
        );

        let target = ConnectionTarget {
            endpoints,
            nodes: target_nodes.to_vec(),
            credentials: config.credentials,
        };

        let mut connection = self.connector.connect(&target).await?;
        let endpoint = connection.endpoint().to_string();

        let result = operation(connection.as_mut()).await;
        connection.close().await;

        result.map_err(|e| tag_with_endpoint(e, &endpoint))
    }
}

/// Add the endpoint to an operation error without changing whether it is retriable
fn tag_with_endpoint(error: Error, endpoint: &str) -> Error {
    warn!("Operation on {} failed: {}", endpoint, error);
    match error {
        Error::ConfigError(message) => Error::ConfigError(format!("{endpoint}: {message}")),
        Error::ValidationError(message) => {
            Error::ValidationError(format!("{endpoint}: {message}"))
        }
        other => other,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::config::tests::sample_talosconfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted connector for exercising the factory and reconciler
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        /// Outcome of each bootstrap call, consumed front to back; empty means success
        pub bootstrap_results: Mutex<VecDeque<Result<()>>>,
        /// Outcome of each connect call; empty means success
        pub connect_results: Mutex<VecDeque<Result<()>>>,
        /// Fail every bootstrap once `bootstrap_results` is drained
        pub always_fail: bool,
        pub connects: AtomicUsize,
        pub bootstraps: Arc<AtomicUsize>,
        pub closes: Arc<AtomicUsize>,
        pub targets: Mutex<Vec<ConnectionTarget>>,
    }

    impl FakeConnector {
        pub(crate) fn failing_bootstraps(failures: usize) -> Self {
            let connector = Self::default();
            {
                let mut results = connector.bootstrap_results.lock().unwrap();
                for i in 0..failures {
                    results.push_back(Err(Error::RemoteCallError {
                        endpoint: "https://10.0.0.5:50000".to_string(),
                        message: format!("attempt {i} rejected"),
                    }));
                }
            }
            connector
        }

        pub(crate) fn always_failing() -> Self {
            Self {
                always_fail: true,
                ..Self::default()
            }
        }
    }

    struct FakeConnection {
        endpoint: String,
        result: Result<()>,
        bootstraps: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MachineConnection for FakeConnection {
        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        async fn bootstrap(&mut self, _request: BootstrapRequest) -> Result<()> {
            self.bootstraps.fetch_add(1, Ordering::SeqCst);
            std::mem::replace(&mut self.result, Ok(()))
        }

        async fn close(self: Box<Self>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MachineConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(target.clone());

            if let Some(Err(e)) = self.connect_results.lock().unwrap().pop_front() {
                return Err(e);
            }

            let scripted = self.bootstrap_results.lock().unwrap().pop_front();
            let result = match scripted {
                Some(result) => result,
                None if self.always_fail => Err(Error::RemoteCallError {
                    endpoint: target.endpoints.first().cloned().unwrap_or_default(),
                    message: "connection refused".to_string(),
                }),
                None => Ok(()),
            };

            Ok(Box::new(FakeConnection {
                endpoint: target.endpoints.first().cloned().unwrap_or_default(),
                result,
                bootstraps: self.bootstraps.clone(),
                closes: self.closes.clone(),
            }))
        }
    }

    fn factory(connector: Arc<FakeConnector>) -> ClientFactory {
        ClientFactory::new(Arc::new(TalosConfigDecoder::default()), connector)
    }

    fn nodes() -> Vec<String> {
        vec!["10.0.0.5".to_string()]
    }

    #[tokio::test]
    async fn test_with_client_runs_operation_and_closes() {
        let connector = Arc::new(FakeConnector::default());
        let result = factory(connector.clone())
            .with_client(&[], &nodes(), &sample_talosconfig(&[]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_client_closes_when_operation_fails() {
        let connector = Arc::new(FakeConnector::failing_bootstraps(1));
        let err = factory(connector.clone())
            .with_client(&[], &nodes(), &sample_talosconfig(&[]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RemoteCallError { .. }));
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    async fn fail_operation_with(error: Error) -> Error {
        factory(Arc::new(FakeConnector::default()))
            .with_client(
                &["10.0.0.9".to_string()],
                &nodes(),
                &sample_talosconfig(&[]),
                move |_conn| Box::pin(async move { Err::<(), _>(error) }),
            )
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_operation_errors_are_tagged_with_endpoint() {
        let err = fail_operation_with(Error::ValidationError("invalid node \"\\n\"".to_string())).await;

        match &err {
            Error::ValidationError(message) => {
                assert!(message.starts_with("10.0.0.9: "), "{message}");
                assert!(message.contains("invalid node"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_operation_config_errors_stay_fatal() {
        let err = fail_operation_with(Error::ConfigError("TLS setup failed".to_string())).await;

        assert!(matches!(&err, Error::ConfigError(m) if m == "10.0.0.9: TLS setup failed"));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_operation_remote_errors_pass_through() {
        let err = fail_operation_with(Error::RemoteCallError {
            endpoint: "10.0.0.9".to_string(),
            message: "Unavailable".to_string(),
        })
        .await;

        assert!(matches!(err, Error::RemoteCallError { .. }));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_bad_credential_never_connects() {
        let connector = Arc::new(FakeConnector::default());
        let err = factory(connector.clone())
            .with_client(&[], &nodes(), "not: [a talosconfig", |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConfigError(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_endpoints_use_derived_default() {
        let connector = Arc::new(FakeConnector::default());
        let factory = factory(connector.clone());

        factory
            .with_client(&[], &nodes(), &sample_talosconfig(&["10.0.0.2"]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap();
        factory
            .with_client(&[], &nodes(), &sample_talosconfig(&[]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap();

        let targets = connector.targets.lock().unwrap();
        assert_eq!(targets[0].endpoints, vec!["10.0.0.2"]);
        assert_eq!(targets[1].endpoints, vec!["10.0.0.5"]);
        assert_eq!(targets[1].nodes, vec!["10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_connection_error_propagates() {
        let connector = Arc::new(FakeConnector::default());
        connector
            .connect_results
            .lock()
            .unwrap()
            .push_back(Err(Error::ConnectionError {
                endpoints: "10.0.0.5".to_string(),
                message: "no route to host".to_string(),
            }));

        let err = factory(connector.clone())
            .with_client(&[], &nodes(), &sample_talosconfig(&[]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectionError { .. }));
        assert_eq!(connector.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_target_nodes_rejected() {
        let err = factory(Arc::new(FakeConnector::default()))
            .with_client(&[], &[], &sample_talosconfig(&[]), |conn| {
                Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
    }
}
