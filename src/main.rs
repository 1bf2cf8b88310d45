//! Node-local capture agent entrypoint.
//!
//! Startup order matters: build the client, create the artifact directory,
//! start the watcher, block until the pod cache has synced, then start the
//! reconcile worker. Shutdown reverses it: stop the watcher and queue, let
//! the worker drain, then cancel every running capture and wait for the
//! children to be reaped.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kube::runtime::reflector;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use antrea_capture_agent::capture::{CaptureSupervisor, DEFAULT_CAPTURE_DIR};
use antrea_capture_agent::controller::{self, Controller};
use antrea_capture_agent::kubernetes;
use antrea_capture_agent::workqueue::WorkQueue;

/// Give up if the initial pod listing has not completed by then.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// On-demand pod packet captures driven by the `tcpdump.antrea.io` annotation
#[derive(Parser, Debug)]
#[command(name = "antrea-capture-agent")]
#[command(about = "Run tcpdump inside annotated pods' network namespaces")]
struct Args {
    /// Node whose pods are watched (set via the downward API in a DaemonSet)
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Directory where capture files are written
    #[arg(long, default_value = DEFAULT_CAPTURE_DIR)]
    capture_dir: PathBuf,

    /// Root of the host proc filesystem (requires host PID visibility)
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %args.node_name,
        capture_dir = %args.capture_dir.display(),
        "starting antrea-capture-agent"
    );

    // In-cluster config first, kubeconfig fallback (KUBECONFIG or
    // ~/.kube/config) for out-of-cluster development.
    let client = Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    std::fs::create_dir_all(&args.capture_dir).with_context(|| {
        format!(
            "failed to create capture directory {}",
            args.capture_dir.display()
        )
    })?;
    std::fs::set_permissions(&args.capture_dir, std::fs::Permissions::from_mode(0o755))
        .with_context(|| {
            format!(
                "failed to set permissions on {}",
                args.capture_dir.display()
            )
        })?;

    let supervisor = Arc::new(CaptureSupervisor::new(
        args.capture_dir.clone(),
        args.proc_root.clone(),
    ));
    let queue = WorkQueue::new();
    let (store, writer) = reflector::store();
    let shutdown = CancellationToken::new();
    let (synced_tx, mut synced_rx) = watch::channel(false);

    let watcher_task = tokio::spawn(kubernetes::run_pod_watcher(
        client,
        args.node_name.clone(),
        writer,
        queue.clone(),
        supervisor.clone(),
        synced_tx,
        shutdown.clone(),
    ));

    tokio::time::timeout(CACHE_SYNC_TIMEOUT, synced_rx.wait_for(|ready| *ready))
        .await
        .context("timed out waiting for pod cache to sync")?
        .context("pod watcher terminated before cache sync")?;
    info!("pod cache synced, starting reconcile worker");

    let controller = Arc::new(Controller::new(store, supervisor.clone()));
    let worker_task = tokio::spawn(controller::run_worker(controller, queue.clone()));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }

    shutdown.cancel();
    queue.shut_down();
    let _ = watcher_task.await;
    let _ = worker_task.await;
    supervisor.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
