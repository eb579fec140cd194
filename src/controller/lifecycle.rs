//! Bootstrap lifecycle: create / read / update / delete
//!
//! The only state tracked is the resource identity. It is set once the
//! machine API accepts the bootstrap trigger and cleared on delete. Nothing
//! is ever read back from the remote side; there is no query that reports
//! whether a node has been bootstrapped.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};

use super::retry::{deadline_for, retry_until, RetryPolicy};
use crate::client::{BootstrapRequest, ClientFactory};
use crate::error::{Error, Result};

/// Identity recorded once the bootstrap call has been accepted
pub const BOOTSTRAP_ID: &str = "machine-bootstrap";

/// Desired state of one bootstrap
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapDeclaration {
    /// Target machine; immutable
    pub node: String,
    /// Machine API endpoints; empty means derive from the credential
    pub endpoints: Vec<String>,
    /// Serialized talosconfig; immutable
    pub talos_config: String,
}

impl std::fmt::Debug for BootstrapDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapDeclaration")
            .field("node", &self.node)
            .field("endpoints", &self.endpoints)
            .field("talos_config", &"<redacted>")
            .finish()
    }
}

impl BootstrapDeclaration {
    pub fn new(node: impl Into<String>, endpoints: Vec<String>, talos_config: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            endpoints,
            talos_config: talos_config.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.trim().is_empty() {
            return Err(Error::ValidationError("node must not be empty".to_string()));
        }
        Ok(())
    }

    /// Identifies the immutable part of the declaration without keeping the credential around
    pub fn fingerprint(&self) -> DeclarationFingerprint {
        DeclarationFingerprint {
            node: self.node.clone(),
            credential_sha256: format!("{:x}", Sha256::digest(self.talos_config.as_bytes())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeclarationFingerprint {
    pub node: String,
    pub credential_sha256: String,
}

/// Immutable fields that differ between two fingerprints
pub fn replacement_fields(
    prior: &DeclarationFingerprint,
    current: &DeclarationFingerprint,
) -> Vec<String> {
    let mut fields = Vec::new();
    if prior.node != current.node {
        fields.push("node".to_string());
    }
    if prior.credential_sha256 != current.credential_sha256 {
        fields.push("talos_config".to_string());
    }
    fields
}

/// Declaration plus the identity the caller persists between runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceState {
    pub declaration: BootstrapDeclaration,
    pub id: Option<String>,
}

impl ResourceState {
    pub fn new(declaration: BootstrapDeclaration) -> Self {
        Self {
            declaration,
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id.filter(|id| !id.is_empty());
        self
    }

    pub fn is_applied(&self) -> bool {
        self.id.is_some()
    }
}

/// Lifecycle entry points driven by a declarative-state framework
#[async_trait]
pub trait ResourceLifecycle: Send + Sync {
    async fn create(&self, state: &mut ResourceState, timeout: Duration) -> Result<()>;
    async fn read(&self, state: &mut ResourceState) -> Result<()>;
    async fn update(&self, state: &mut ResourceState, prior: &DeclarationFingerprint)
        -> Result<()>;
    async fn delete(&self, state: &mut ResourceState) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

/// Structured failure report handed back to the framework
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub summary: String,
    pub detail: String,
    /// Whether another reconciliation pass may succeed
    pub retriable: bool,
}

impl From<&Error> for Diagnostic {
    fn from(error: &Error) -> Self {
        let summary = match error {
            Error::ConfigError(_) => "Invalid talos_config",
            Error::ConnectionError { .. } => "Machine API unreachable",
            Error::RemoteCallError { .. } => "Bootstrap rejected",
            Error::TimeoutError { .. } => "Timed out waiting for bootstrap",
            Error::ImmutableFieldError(_) => "Immutable field changed",
            Error::ValidationError(_) => "Invalid declaration",
            _ => "Reconciliation failed",
        };

        Self {
            // an immutable change is resolved by replacing the bootstrap
            severity: match error {
                Error::ImmutableFieldError(_) => Severity::Warning,
                _ => Severity::Error,
            },
            summary: summary.to_string(),
            detail: error.to_string(),
            // a timed out create leaves the identity unset, so the next pass tries again
            retriable: error.is_retriable() || matches!(error, Error::TimeoutError { .. }),
        }
    }
}

impl Diagnostic {
    /// Log at the level matching the severity
    pub fn log(&self, subject: &str) {
        match self.severity {
            Severity::Error => error!("{}: {}: {}", subject, self.summary, self.detail),
            Severity::Warning => warn!("{}: {}: {}", subject, self.summary, self.detail),
        }
    }
}

/// Issues the bootstrap trigger with bounded retry
#[derive(Clone)]
pub struct BootstrapReconciler {
    factory: ClientFactory,
    policy: RetryPolicy,
}

impl BootstrapReconciler {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn trigger(&self, declaration: &BootstrapDeclaration, budget: Duration) -> Result<()> {
        let nodes = vec![declaration.node.clone()];
        let nodes = &nodes;

        retry_until(budget, self.policy, |attempt| async move {
            debug!("Bootstrap attempt {} for node {}", attempt, declaration.node);

            #[cfg(feature = "metrics")]
            crate::controller::metrics::inc_bootstrap_attempt(&declaration.node);

            let result = self
                .factory
                .with_client(
                    &declaration.endpoints,
                    nodes,
                    &declaration.talos_config,
                    |conn| Box::pin(async move { conn.bootstrap(BootstrapRequest::default()).await }),
                )
                .await;

            if let Err(e) = &result {
                warn!("Bootstrap attempt {} for node {} failed: {}", attempt, declaration.node, e);
            }
            result
        })
        .await
    }
}

#[async_trait]
impl ResourceLifecycle for BootstrapReconciler {
    #[instrument(skip(self, state), fields(node = %state.declaration.node))]
    async fn create(&self, state: &mut ResourceState, timeout: Duration) -> Result<()> {
        if state.is_applied() {
            info!(
                "Node {} already bootstrapped, not triggering again",
                state.declaration.node
            );
            return Ok(());
        }

        state.declaration.validate()?;
        // a malformed credential never enters the retry loop
        self.factory
            .validate_credential(&state.declaration.talos_config)?;

        let budget = deadline_for(timeout);
        info!(
            "Bootstrapping node {} (retry budget {:?})",
            state.declaration.node, budget
        );

        let outcome = self.trigger(&state.declaration, budget).await;

        #[cfg(feature = "metrics")]
        crate::controller::metrics::inc_bootstrap_outcome(
            &state.declaration.node,
            match &outcome {
                Ok(()) => "success",
                Err(e) => e.kind(),
            },
        );

        outcome?;

        state.id = Some(BOOTSTRAP_ID.to_string());
        info!("Node {} bootstrapped", state.declaration.node);

        self.read(state).await
    }

    async fn read(&self, state: &mut ResourceState) -> Result<()> {
        // bootstrap status cannot be queried remotely
        debug!(
            "Read for node {} is a no-op (id: {:?})",
            state.declaration.node, state.id
        );
        Ok(())
    }

    #[instrument(skip(self, state, prior), fields(node = %state.declaration.node))]
    async fn update(
        &self,
        state: &mut ResourceState,
        prior: &DeclarationFingerprint,
    ) -> Result<()> {
        let changed = replacement_fields(prior, &state.declaration.fingerprint());
        if !changed.is_empty() {
            return Err(Error::ImmutableFieldError(changed));
        }
        self.read(state).await
    }

    #[instrument(skip(self, state), fields(node = %state.declaration.node))]
    async fn delete(&self, state: &mut ResourceState) -> Result<()> {
        // bootstrap cannot be reverted; only forget it
        state.id = None;
        info!(
            "Removed bootstrap record for node {} (no remote action)",
            state.declaration.node
        );
        Ok(())
    }
}
