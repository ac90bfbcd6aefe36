//! notebook-gateway: start a notebook sandbox container and serve it on one port.
//!
//! Usage:
//!   notebook-gateway <IMAGE> <FOLDER> [--listen 0.0.0.0:3000] [--config gateway.json]

use clap::Parser;
use notebook_gateway::docker::DockerRuntime;
use notebook_gateway::error::ProvisionError;
use notebook_gateway::router::validate_rules;
use notebook_gateway::{provision, Error, Gateway, GatewayConfig, Mount, Router, Runtime, Sandbox};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "notebook-gateway")]
#[command(about = "Run a notebook sandbox behind a single HTTP gateway")]
struct Args {
    /// Container image running the notebook server
    image: String,

    /// Host folder to mount into the sandbox
    folder: PathBuf,

    /// JSON config file
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "GATEWAY_LISTEN")]
    listen: Option<SocketAddr>,

    /// Path prefix to tunnel; replaces the configured routes
    #[arg(long = "tunnel-prefix", env = "GATEWAY_TUNNEL_PREFIXES", value_delimiter = ',')]
    tunnel_prefixes: Vec<String>,

    /// Path prefix to proxy even inside a tunneled prefix
    #[arg(long = "proxy-prefix", env = "GATEWAY_PROXY_PREFIXES", value_delimiter = ',')]
    proxy_prefixes: Vec<String>,

    /// Where the folder is mounted inside the sandbox
    #[arg(long, env = "GATEWAY_MOUNT_TARGET")]
    mount_target: Option<String>,

    /// Docker unix socket (default: DOCKER_HOST or the platform socket)
    #[arg(long, env = "GATEWAY_DOCKER_SOCKET")]
    docker_socket: Option<PathBuf>,

    /// Mount the folder read-only
    #[arg(long, env = "GATEWAY_READ_ONLY")]
    read_only: bool,

    /// Leave the container running on exit
    #[arg(long)]
    keep_container: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(target) = args.mount_target {
        config.mount_target = target;
    }
    config.override_routes(&args.tunnel_prefixes, &args.proxy_prefixes);
    config.validate()?;
    validate_rules(&config.routes)?;

    let folder = std::fs::canonicalize(&args.folder).map_err(|source| ProvisionError::MountSource {
        path: args.folder.clone(),
        source,
    })?;
    info!(image = %args.image, folder = %folder.display(), "Starting sandbox");

    let runtime = match &args.docker_socket {
        Some(path) => DockerRuntime::connect_socket(path)?,
        None => DockerRuntime::connect_local()?,
    };
    let mounts = [Mount::new(folder, config.mount_target.clone()).read_only(args.read_only)];
    let sandbox = provision(&runtime, &args.image, &mounts).await?;

    let result = serve(&config, &sandbox).await;

    if args.keep_container {
        info!(container = %sandbox.id, "Leaving container running");
    } else {
        info!(container = %sandbox.id, "Removing container");
        if let Err(e) = runtime.remove(&sandbox.id).await {
            warn!("{}", e);
        }
    }
    result
}

async fn serve(config: &GatewayConfig, sandbox: &Sandbox) -> Result<(), Error> {
    let router = Router::new(config.routes.clone(), sandbox.endpoint.clone())?;
    for rule in router.rules() {
        info!(prefix = %rule.path_prefix, mode = ?rule.mode, "Route");
    }

    let listener = Gateway::bind(config.listen).await?;
    Gateway::new(router, config.gateway_options())
        .serve_with_shutdown(listener, shutdown_signal())
        .await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
