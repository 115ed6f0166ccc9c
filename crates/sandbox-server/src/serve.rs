use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use sandbox::ContainerRuntime;
use sandbox_docker::DockerRuntime;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::{self, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::lifecycle::Lifecycle;
use crate::rpc::{AppState, router};
use crate::timeline::CallTimeline;

#[derive(Args)]
pub struct ServeArgs {
    /// Path to the server YAML config (defaults apply when omitted)
    #[arg(long, env = "SANDBOX_SERVER_CONFIG")]
    pub config: Option<PathBuf>,
    /// Listen address, overriding the config file
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

#[derive(Args)]
pub struct InitConfigArgs {
    /// Where to write the default config
    #[arg(long, default_value = "sandbox-server.yaml")]
    pub path: PathBuf,
}

/// Serve the RPC API until SIGTERM or SIGINT, then stop every sandbox.
pub async fn run_serve(args: ServeArgs) -> ServerResult<()> {
    let config = match &args.config {
        Some(path) => config::load(path).await?,
        None => ServerConfig::default(),
    };
    let listen = args.listen.unwrap_or(config.listen);

    let docker = config.docker_config();
    let image = docker.image.clone();
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(docker));
    let lifecycle = Arc::new(Lifecycle::new(runtime));
    let state = AppState {
        lifecycle: Arc::clone(&lifecycle),
        timeline: Arc::new(CallTimeline::default()),
        defaults: config.sandbox_defaults(),
    };

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| ServerError::Config(format!("bind {listen}: {e}")))?;
    info!(
        listen = %listen,
        runtime = lifecycle.runtime_name(),
        image = %image,
        "sandbox server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    lifecycle.shutdown().await;
    info!("sandbox server stopped");
    Ok(())
}

/// Write a config file populated with defaults.
pub async fn run_init_config(args: InitConfigArgs) -> ServerResult<()> {
    config::generate(&ServerConfig::default(), &args.path).await?;
    info!(path = %args.path.display(), "config written");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM, stopping"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT, stopping"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
