//! Volume Provisioner
//!
//! One binary, three roles:
//!
//! - `controller`: provisions and binds pending PersistentVolumeClaims
//! - `node`: prepares the kubelet root and tracks mount helper pods
//! - `exec-server`: serves mount commands for volume plugins over Unix sockets

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_provisioner::mount::{LinuxMounter, Mounter, MounterConfig, OsExec};
use volume_provisioner::provisioning::{
    metrics, run_watchers, ControllerConfig, KubeClaimStore, KubeEventRecorder,
    ProvisioningController,
};
use volume_provisioner::rpc::{run_exec_servers, ExecServerConfig};
use volume_provisioner::validation::ValidationOptions;
use volume_provisioner::volume::plugins::{HostPathConfig, PluginConfig, PluginFactory};
use volume_provisioner::volume::{
    KubeObjectLookup, MountPodManager, NodeVolumeHost, VolumeHostConfig, DEFAULT_ROOT_DIR,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Provisioner - dynamic provisioning and mount execution for Kubernetes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    /// Kubelet root directory; plugin sockets live below it
    #[arg(long, env = "ROOT_DIR", default_value = DEFAULT_ROOT_DIR, global = true)]
    root_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the provisioning controller
    Controller(ControllerArgs),
    /// Run the node agent
    Node(NodeArgs),
    /// Serve exec requests for the named volume plugins
    ExecServer(ExecServerArgs),
}

#[derive(ClapArgs, Debug)]
struct ControllerArgs {
    /// Storage class for claims that do not name one
    #[arg(long, env = "DEFAULT_STORAGE_CLASS")]
    default_storage_class: Option<String>,

    /// Number of concurrent claim workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds between resyncs of all unbound claims
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "15")]
    resync_interval_secs: u64,

    /// Attempts at persisting a provisioned volume object
    #[arg(long, env = "CREATE_VOLUME_ATTEMPTS", default_value = "5")]
    create_volume_attempts: u32,

    /// Base directory for host-path provisioned volumes
    #[arg(long, env = "HOST_PATH_BASE", default_value = "/tmp/hostpath_pv")]
    host_path_base: PathBuf,

    /// Accept storage classes that set allowVolumeExpansion
    #[arg(long, env = "ALLOW_VOLUME_EXPANSION")]
    allow_volume_expansion: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,
}

#[derive(ClapArgs, Debug)]
struct NodeArgs {
    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Namespace holding mount helper pods
    #[arg(long, env = "MOUNT_POD_NAMESPACE", default_value = "kube-mount")]
    mount_pod_namespace: String,

    /// Containerized mounter used for network filesystems
    #[arg(long, env = "CONTAINERIZED_MOUNTER")]
    containerized_mounter: Option<PathBuf>,

    /// Base directory for host-path provisioned volumes
    #[arg(long, env = "HOST_PATH_BASE", default_value = "/tmp/hostpath_pv")]
    host_path_base: PathBuf,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,
}

#[derive(ClapArgs, Debug)]
struct ExecServerArgs {
    /// Volume plugin names to serve, e.g. kubernetes.io/nfs
    #[arg(required = true)]
    plugins: Vec<String>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Volume Provisioner");
    info!("  Version: {}", volume_provisioner::VERSION);
    info!("  Root dir: {}", args.root_dir.display());

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match &args.command {
        Command::Controller(cmd) => run_controller(&args, cmd, shutdown).await?,
        Command::Node(cmd) => run_node(&args, cmd, shutdown).await?,
        Command::ExecServer(cmd) => {
            let config = ExecServerConfig {
                root_dir: args.root_dir.clone(),
            };
            run_exec_servers(config, cmd.plugins.clone(), shutdown)
                .await
                .context("exec servers failed")?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(
    args: &Args,
    cmd: &ControllerArgs,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API server")?;
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());

    let host = Arc::new(NodeVolumeHost::new(
        VolumeHostConfig {
            root_dir: args.root_dir.clone(),
            hostname: hostname.clone(),
            host_ip: None,
        },
        Arc::new(LinuxMounter::new(MounterConfig::default())),
        Arc::new(OsExec::new()),
        Arc::new(KubeObjectLookup::new(client.clone(), hostname)),
    ));
    let plugins = PluginFactory::all(&PluginConfig {
        host_path: HostPathConfig {
            base_path: cmd.host_path_base.clone(),
        },
    });
    let registry = host
        .initialize_plugins(plugins)
        .context("initializing volume plugins")?;
    info!("Volume plugins: {}", registry.plugin_names().join(", "));

    let config = ControllerConfig {
        default_storage_class: cmd.default_storage_class.clone(),
        resync_period: Duration::from_secs(cmd.resync_interval_secs.max(1)),
        workers: cmd.workers,
        create_attempts: cmd.create_volume_attempts,
        validation: ValidationOptions {
            allow_volume_expansion: cmd.allow_volume_expansion,
        },
        ..Default::default()
    };
    info!("  Default storage class: {:?}", config.default_storage_class);
    info!("  Workers: {}", config.workers);

    let controller = ProvisioningController::new(
        config,
        Arc::new(KubeClaimStore::new(client.clone())),
        registry,
        Arc::new(KubeEventRecorder::new(client.clone(), volume_provisioner::NAME)),
    );

    let ready = Arc::new(AtomicBool::new(false));
    spawn_health_server(cmd.health_addr.clone(), ready.clone());

    let metrics_addr = cmd.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let watchers = tokio::spawn(run_watchers(controller.clone(), client, shutdown.clone()));
    ready.store(true, Ordering::SeqCst);

    controller.run(shutdown.clone()).await?;
    shutdown.cancel();
    watchers.await.context("watcher task panicked")??;
    Ok(())
}

// =============================================================================
// Node Agent
// =============================================================================

async fn run_node(args: &Args, cmd: &NodeArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API server")?;

    let mounter = Arc::new(LinuxMounter::new(MounterConfig {
        mounter_path: cmd.containerized_mounter.clone(),
        ..Default::default()
    }));
    std::fs::create_dir_all(&args.root_dir)
        .with_context(|| format!("creating {}", args.root_dir.display()))?;
    mounter
        .make_shared(&args.root_dir)
        .await
        .with_context(|| format!("making {} shared", args.root_dir.display()))?;

    let host = Arc::new(NodeVolumeHost::new(
        VolumeHostConfig {
            root_dir: args.root_dir.clone(),
            hostname: cmd.node_name.clone(),
            host_ip: None,
        },
        mounter,
        Arc::new(OsExec::new()),
        Arc::new(KubeObjectLookup::new(client.clone(), cmd.node_name.clone())),
    ));
    let registry = host
        .initialize_plugins(PluginFactory::all(&PluginConfig {
            host_path: HostPathConfig {
                base_path: cmd.host_path_base.clone(),
            },
        }))
        .context("initializing volume plugins")?;

    let mount_pods = Arc::new(MountPodManager::for_registry(
        cmd.mount_pod_namespace.clone(),
        &registry,
    ));
    host.set_mount_pods(mount_pods.clone(), client.clone())?;
    info!(
        "Node agent for {} ready with {} volume plugins",
        cmd.node_name,
        registry.len()
    );

    let ready = Arc::new(AtomicBool::new(true));
    spawn_health_server(cmd.health_addr.clone(), ready);

    mount_pods.run(client, shutdown).await?;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,kube=info", level))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn spawn_health_server(addr: String, ready: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&addr, ready).await {
            error!("Health server error: {}", e);
        }
    });
}

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {:?}", addr))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => match metrics::encode() {
                    Ok((content_type, buffer)) => {
                        let mut response = Response::new(Body::from(buffer));
                        if let Ok(value) = hyper::header::HeaderValue::from_str(&content_type) {
                            response
                                .headers_mut()
                                .insert(hyper::header::CONTENT_TYPE, value);
                        }
                        response
                    }
                    Err(e) => {
                        error!("Encoding metrics failed: {}", e);
                        text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
                    }
                },
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {:?}", addr))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
