//! Main reconciler for MachineBootstrap resources
//!
//! Implements the controller pattern using kube-rs runtime and maps the
//! Kubernetes object lifecycle onto the bootstrap create/read/update/delete
//! entry points.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::conditions::{
    bootstrap_failed_condition, bootstrapped_condition, is_condition_true, progressing_condition,
    set_condition, CONDITION_TYPE_BOOTSTRAPPED,
};
use super::finalizers::{has_finalizer, is_being_deleted, MACHINE_BOOTSTRAP_FINALIZER};
use super::lifecycle::{
    BootstrapReconciler, DeclarationFingerprint, Diagnostic, ResourceLifecycle, ResourceState,
};
use super::retry::retry_backoff;
use crate::crd::{BootstrapPhase, MachineBootstrap, MachineBootstrapStatus};
use crate::error::{Error, Result};

/// Field manager and metrics label for this controller
pub const CONTROLLER_NAME: &str = "machinebootstrap";

const FIELD_MANAGER: &str = "talos-bootstrap";
const NON_LEADER_REQUEUE: Duration = Duration::from_secs(15);

/// Retries for the status write that records an accepted bootstrap
pub(crate) const STATUS_WRITE_RETRIES: u32 = 5;

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub reconciler: BootstrapReconciler,
    /// Used when a resource does not set `createTimeoutSeconds`
    pub default_create_timeout: Duration,
    pub is_leader: Arc<AtomicBool>,
    pub unpersisted: UnpersistedBootstraps,
}

/// Bootstrap accepted by the machine API
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AcceptedBootstrap {
    pub id: String,
    pub fingerprint: DeclarationFingerprint,
}

/// Accepted bootstraps whose status write has not landed yet, keyed by object uid
///
/// Consulted before the status so a lost write never leads to a second trigger
/// from this process.
#[derive(Debug, Default)]
pub struct UnpersistedBootstraps(Mutex<HashMap<String, AcceptedBootstrap>>);

impl UnpersistedBootstraps {
    pub(crate) fn remember(&self, uid: &str, accepted: AcceptedBootstrap) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid.to_string(), accepted);
    }

    pub(crate) fn get(&self, uid: &str) -> Option<AcceptedBootstrap> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    pub(crate) fn forget(&self, uid: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(uid);
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let bootstraps: Api<MachineBootstrap> = Api::all(client.clone());

    info!("Starting MachineBootstrap controller");

    // Verify CRD exists
    match bootstraps.list(&Default::default()).await {
        Ok(_) => info!("MachineBootstrap CRD is available"),
        Err(e) => {
            error!(
                "MachineBootstrap CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "MachineBootstrap CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(bootstraps, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Helper to emit a Kubernetes Event
async fn emit_event(
    client: &Client,
    mb: &MachineBootstrap,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()> {
    let namespace = mb.namespace().unwrap_or_else(|| "default".to_string());
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", mb.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: mb.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events
        .create(&PostParams::default(), &event)
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Events are informational; a failed write only gets logged
async fn record_event(
    client: &Client,
    mb: &MachineBootstrap,
    event_type: &str,
    reason: &str,
    message: &str,
) {
    if let Err(e) = emit_event(client, mb, event_type, reason, message).await {
        warn!("Failed to emit {} event for {}: {}", reason, mb.name_any(), e);
    }
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A MachineBootstrap is created, updated, or deleted
/// - The requeue timer expires
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<MachineBootstrap>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping {}", obj.name_any());
        return Ok(Action::requeue(NON_LEADER_REQUEUE));
    }

    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MachineBootstrap> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(
        "Reconciling MachineBootstrap {}/{} (node: {}, deleting: {}, finalizer: {})",
        namespace,
        obj.name_any(),
        obj.spec.node,
        is_being_deleted(&obj),
        has_finalizer(&obj)
    );

    // Use kube-rs built-in finalizer helper for clean lifecycle management
    let result = finalizer(&api, MACHINE_BOOTSTRAP_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(mb) => apply_machine_bootstrap(&ctx, &mb).await,
            FinalizerEvent::Cleanup(mb) => cleanup_machine_bootstrap(&ctx, &mb).await,
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            CONTROLLER_NAME,
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            super::metrics::inc_reconcile_error(CONTROLLER_NAME, e.kind());
        }
    }
    #[cfg(not(feature = "metrics"))]
    debug!("Reconcile finished in {:?}", started.elapsed());

    result
}

/// Create or refresh the bootstrap for a MachineBootstrap
#[instrument(skip(ctx, mb), fields(name = %mb.name_any(), namespace = mb.namespace()))]
async fn apply_machine_bootstrap(ctx: &ControllerState, mb: &MachineBootstrap) -> Result<Action> {
    let client = &ctx.client;
    let uid = mb.uid().unwrap_or_default();
    let unpersisted = ctx.unpersisted.get(&uid);
    let mut state = recovered_state(mb, unpersisted.as_ref());

    if state.is_applied() {
        let prior = unpersisted
            .map(|accepted| accepted.fingerprint)
            .unwrap_or_else(|| prior_fingerprint(mb, &state));
        match ctx.reconciler.update(&mut state, &prior).await {
            Ok(()) => {
                if needs_status_refresh(mb) {
                    let status = build_status(mb, &state, None);
                    persist_with_retry(STATUS_WRITE_RETRIES, || patch_status(client, mb, &status))
                        .await?;
                }
                ctx.unpersisted.forget(&uid);
                return Ok(Action::await_change());
            }
            Err(e @ Error::ImmutableFieldError(_)) => {
                let diagnostic = Diagnostic::from(&e);
                diagnostic.log(&mb.name_any());
                let message = format!("{}, bootstrapping again", diagnostic.detail);
                record_event(client, mb, "Normal", "Replacing", &message).await;
                ctx.reconciler.delete(&mut state).await?;
                ctx.unpersisted.forget(&uid);
            }
            Err(e) => return Err(e),
        }
    }

    patch_status(client, mb, &build_status(mb, &state, None)).await?;

    let timeout = create_timeout(mb, ctx.default_create_timeout);
    let outcome = ctx.reconciler.create(&mut state, timeout).await;
    let status = build_status(mb, &state, outcome.as_ref().err());

    if let Some(id) = &state.id {
        ctx.unpersisted.remember(
            &uid,
            AcceptedBootstrap {
                id: id.clone(),
                fingerprint: state.declaration.fingerprint(),
            },
        );
        persist_with_retry(STATUS_WRITE_RETRIES, || patch_status(client, mb, &status)).await?;
        ctx.unpersisted.forget(&uid);
    } else {
        patch_status(client, mb, &status).await?;
    }

    match outcome {
        Ok(()) => {
            record_event(
                client,
                mb,
                "Normal",
                "Bootstrapped",
                &format!("Machine API accepted bootstrap for node {}", mb.spec.node),
            )
            .await;
            Ok(Action::await_change())
        }
        Err(e) => {
            let diagnostic = Diagnostic::from(&e);
            diagnostic.log(&format!("node {}", mb.spec.node));
            record_event(client, mb, "Warning", "BootstrapFailed", &diagnostic.detail).await;
            Err(e)
        }
    }
}

/// Forget the bootstrap when the MachineBootstrap is deleted
#[instrument(skip(ctx, mb), fields(name = %mb.name_any(), namespace = mb.namespace()))]
async fn cleanup_machine_bootstrap(
    ctx: &ControllerState,
    mb: &MachineBootstrap,
) -> Result<Action> {
    let mut state = resource_state(mb);
    ctx.reconciler.delete(&mut state).await?;
    ctx.unpersisted.forget(&mb.uid().unwrap_or_default());

    info!(
        "Cleanup complete for MachineBootstrap {}/{}",
        mb.namespace().unwrap_or_default(),
        mb.name_any()
    );
    Ok(Action::await_change())
}

/// Rebuild the lifecycle state from the spec and the identity kept in status
pub(crate) fn resource_state(mb: &MachineBootstrap) -> ResourceState {
    ResourceState::new(mb.spec.declaration())
        .with_id(mb.status.as_ref().and_then(|s| s.bootstrap_id.clone()))
}

/// Like [`resource_state`], but falls back to an accepted bootstrap the status does not show yet
pub(crate) fn recovered_state(
    mb: &MachineBootstrap,
    unpersisted: Option<&AcceptedBootstrap>,
) -> ResourceState {
    let state = resource_state(mb);
    match unpersisted {
        Some(accepted) if !state.is_applied() => {
            info!(
                "Status of {} lost bootstrap {}, restoring it",
                mb.name_any(),
                accepted.id
            );
            state.with_id(Some(accepted.id.clone()))
        }
        _ => state,
    }
}

/// Fingerprint the recorded bootstrap was issued with
///
/// Status written before the fingerprint existed is treated as matching the
/// current spec.
pub(crate) fn prior_fingerprint(mb: &MachineBootstrap, state: &ResourceState) -> DeclarationFingerprint {
    mb.status
        .as_ref()
        .and_then(|s| s.applied_fingerprint())
        .unwrap_or_else(|| state.declaration.fingerprint())
}

/// Per-resource override, falling back to the operator default
pub(crate) fn create_timeout(mb: &MachineBootstrap, default: Duration) -> Duration {
    mb.spec
        .create_timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub(crate) fn needs_status_refresh(mb: &MachineBootstrap) -> bool {
    match &mb.status {
        Some(status) => {
            status.phase != BootstrapPhase::Bootstrapped
                || !is_condition_true(&status.conditions, CONDITION_TYPE_BOOTSTRAPPED)
                || status.observed_generation != mb.metadata.generation
        }
        None => true,
    }
}

/// Status after a lifecycle step
///
/// With no failure and no identity the create is still running.
pub(crate) fn build_status(
    mb: &MachineBootstrap,
    state: &ResourceState,
    failure: Option<&Error>,
) -> MachineBootstrapStatus {
    let generation = mb.metadata.generation;
    let mut status = mb.status.clone().unwrap_or_default();
    status.observed_generation = generation;

    if state.is_applied() {
        let fingerprint = state.declaration.fingerprint();
        status.bootstrap_id = state.id.clone();
        status.applied_node = Some(fingerprint.node);
        status.applied_config_hash = Some(fingerprint.credential_sha256);
    } else {
        status.bootstrap_id = None;
        status.applied_node = None;
        status.applied_config_hash = None;
    }

    match (failure, state.is_applied()) {
        (Some(e), _) => {
            let diagnostic = Diagnostic::from(e);
            status.phase = BootstrapPhase::Failed;
            status.message = Some(diagnostic.detail.clone());
            set_condition(
                &mut status.conditions,
                bootstrap_failed_condition(&diagnostic, generation),
            );
            set_condition(
                &mut status.conditions,
                progressing_condition(false, "Failed", &diagnostic.summary, generation),
            );
        }
        (None, true) => {
            status.phase = BootstrapPhase::Bootstrapped;
            status.message = Some(format!("Node {} bootstrapped", state.declaration.node));
            set_condition(
                &mut status.conditions,
                bootstrapped_condition(&state.declaration.node, generation),
            );
            set_condition(
                &mut status.conditions,
                progressing_condition(false, "Settled", "Bootstrap accepted", generation),
            );
        }
        (None, false) => {
            status.phase = BootstrapPhase::Bootstrapping;
            status.message = Some(format!(
                "Waiting for the machine API on node {} to accept bootstrap",
                state.declaration.node
            ));
            set_condition(
                &mut status.conditions,
                progressing_condition(true, "Retrying", "Bootstrap in progress", generation),
            );
        }
    }

    status
}

/// Merge patch body for a status
///
/// Absent identity fields are sent as null so a merge patch clears them.
pub(crate) fn status_patch(status: &MachineBootstrapStatus) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(status)?;
    if let Some(map) = value.as_object_mut() {
        for key in ["message", "bootstrapId", "appliedNode", "appliedConfigHash"] {
            map.entry(key).or_insert(serde_json::Value::Null);
        }
    }
    Ok(serde_json::json!({ "status": value }))
}

/// Update the status subresource of a MachineBootstrap
async fn patch_status(
    client: &Client,
    mb: &MachineBootstrap,
    status: &MachineBootstrapStatus,
) -> Result<()> {
    let namespace = mb.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<MachineBootstrap> = Api::namespaced(client.clone(), &namespace);

    let patch = status_patch(status)?;
    api.patch_status(
        &mb.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await
    .map_err(Error::KubeError)?;

    debug!("Status of {} set to {}", mb.name_any(), status.phase);
    Ok(())
}

/// Run a status write, retrying retriable failures up to `retries` more times
pub(crate) async fn persist_with_retry<F, Fut>(retries: u32, mut write: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        match write().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries && e.is_retriable() => {
                let delay = retry_backoff(attempt);
                warn!(
                    "Status write attempt {} failed, retrying in {:?}: {}",
                    attempt + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// How long to wait before retrying a failed reconcile
pub(crate) fn requeue_after(error: &Error) -> Duration {
    // Use shorter retry for retriable errors
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}

/// Error policy determines how to handle reconciliation errors
fn error_policy(mb: Arc<MachineBootstrap>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", mb.name_any(), error);
    Action::requeue(requeue_after(error))
}
