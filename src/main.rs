use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use talos_bootstrap::client::{ClientFactory, GrpcConnector, TalosConfigDecoder};
use talos_bootstrap::controller::{
    self, BootstrapDeclaration, BootstrapReconciler, Diagnostic, ResourceLifecycle,
    ResourceState, RetryPolicy,
};
use talos_bootstrap::crd::MachineBootstrap;
use talos_bootstrap::leader::{self, LeaseConfig};
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Bootstrap a single node and exit
    Bootstrap(BootstrapArgs),
    /// Print the MachineBootstrap CRD as YAML
    Crd,
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Operator namespace, holds the leader election lease
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "talos-system")]
    namespace: String,

    /// Create timeout for resources that do not set one
    #[arg(long, env = "CREATE_TIMEOUT_SECS", default_value_t = 1200)]
    create_timeout_secs: u64,

    /// Which failures the bootstrap retry loop absorbs
    #[arg(long, env = "RETRY_POLICY", value_enum, default_value_t = RetryPolicy::RetryAll)]
    retry_policy: RetryPolicy,

    /// Listen address for /health and /metrics
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,
}

#[derive(Parser, Debug)]
struct BootstrapArgs {
    /// Node to bootstrap
    #[arg(long)]
    node: String,

    /// Machine API endpoint, repeatable; defaults to the talosconfig endpoints
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Path to the talosconfig file
    #[arg(long, env = "TALOSCONFIG")]
    talosconfig: PathBuf,

    /// talosconfig context to use instead of the current one
    #[arg(long)]
    context: Option<String>,

    /// Overall timeout; the retry loop stops one minute earlier
    #[arg(long, default_value_t = 1200)]
    timeout_secs: u64,

    /// Which failures the bootstrap retry loop absorbs
    #[arg(long, value_enum, default_value_t = RetryPolicy::RetryAll)]
    retry_policy: RetryPolicy,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("talos-bootstrap v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&MachineBootstrap::crd())?);
            Ok(())
        }
        Commands::Bootstrap(bootstrap_args) => {
            init_tracing(args.log_json, false);
            run_bootstrap(bootstrap_args).await
        }
        Commands::Run(run_args) => {
            let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();
            init_tracing(args.log_json, otel_enabled);
            let result = run_operator(run_args).await;

            // Flush any remaining traces
            talos_bootstrap::telemetry::shutdown_telemetry();

            result
        }
    }
}

fn init_tracing(json: bool, otel_enabled: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let (plain, json) = if json {
        (None, Some(fmt::layer().json().with_target(true)))
    } else {
        (Some(fmt::layer().with_target(true)), None)
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json);

    if otel_enabled {
        let otel_layer = talos_bootstrap::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
}

fn load_talosconfig(path: &Path) -> anyhow::Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading talosconfig {}", path.display()))?;
    if contents.trim().is_empty() {
        anyhow::bail!("talosconfig {} is empty", path.display());
    }
    Ok(contents)
}

fn factory_for(context: Option<String>) -> ClientFactory {
    match context {
        Some(context) => ClientFactory::new(
            Arc::new(TalosConfigDecoder::with_context(context)),
            Arc::new(GrpcConnector::default()),
        ),
        None => ClientFactory::default(),
    }
}

async fn run_bootstrap(args: BootstrapArgs) -> anyhow::Result<()> {
    let talos_config = load_talosconfig(&args.talosconfig)?;
    let reconciler = BootstrapReconciler::new(factory_for(args.context)).with_policy(args.retry_policy);

    let mut state = ResourceState::new(BootstrapDeclaration::new(
        args.node.clone(),
        args.endpoints,
        talos_config,
    ));

    match reconciler
        .create(&mut state, Duration::from_secs(args.timeout_secs))
        .await
    {
        Ok(()) => {
            info!("Node {} bootstrapped", args.node);
            println!("{}", state.id.unwrap_or_default());
            Ok(())
        }
        Err(e) => {
            Diagnostic::from(&e).log(&format!("node {}", args.node));
            Err(e).with_context(|| format!("bootstrapping node {}", args.node))
        }
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    info!("Starting talos-bootstrap operator v{}", env!("CARGO_PKG_VERSION"));

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .context("connecting to Kubernetes")?;

    info!("Connected to Kubernetes cluster");

    // Leader election configuration
    let leader_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
    let holder_identity = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    });

    info!("Leader election using holder ID: {}", holder_identity);

    let is_leader = Arc::new(AtomicBool::new(false));
    tokio::spawn(leader::run_leader_election(
        client.clone(),
        LeaseConfig::new(leader_namespace, holder_identity),
        Arc::clone(&is_leader),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::new(talos_bootstrap::rest_api::ApiState {
            is_leader: Arc::clone(&is_leader),
        });
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = talos_bootstrap::rest_api::run_server(addr, api_state).await {
                error!("REST API server failed: {}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    info!("REST API disabled, ignoring {}", args.metrics_addr);

    let reconciler = BootstrapReconciler::new(ClientFactory::default()).with_policy(args.retry_policy);

    // Create shared controller state
    let state = Arc::new(controller::ControllerState {
        client,
        reconciler,
        default_create_timeout: Duration::from_secs(args.create_timeout_secs),
        is_leader,
        unpersisted: controller::UnpersistedBootstraps::default(),
    });

    // Run the main controller loop
    controller::run_controller(state).await?;
    Ok(())
}
