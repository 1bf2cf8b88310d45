//! Capture process supervision.
//!
//! The supervisor owns at most one running capture per pod identity. Starting
//! a capture resolves the pod's first container to a host PID, then launches
//! `tcpdump` inside that process's network namespace via `nsenter`. Each
//! running capture is paired with a cancellation token and a detached wait
//! task that owns the child handle; cancellation delivers SIGTERM (with a
//! SIGKILL fallback) and the wait task reaps the child.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::discovery;

/// Annotation marking a pod for capture. The value is the `tcpdump -W`
/// rotation count, passed through verbatim.
pub const ANNOTATION_KEY: &str = "tcpdump.antrea.io";

/// Default directory for capture artifacts.
pub const DEFAULT_CAPTURE_DIR: &str = "/var/log/antrea-captures";

/// How long a capture child gets to exit after SIGTERM before SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A pod's stable `namespace/name` identity.
///
/// Stable across updates and reused when a pod is deleted and recreated
/// under the same name; recreation is detected by UID instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub namespace: String,
    pub name: String,
}

impl Identity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` work-queue key.
    pub fn parse(key: &str) -> Option<Self> {
        let (namespace, name) = key.split_once('/')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Artifact file prefix. Includes the namespace so identically-named
    /// pods in different namespaces never share files.
    pub fn artifact_prefix(&self) -> String {
        format!("capture-{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Everything the supervisor needs to run a capture, derived from a pod
/// snapshot by the controller.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub identity: Identity,
    /// Pod UID; a different UID under the same identity means the pod was
    /// recreated and the old capture must be replaced.
    pub uid: String,
    /// Container runtime URI, e.g. `containerd://abc123...`.
    pub container_id: String,
    /// Rotation count for `tcpdump -W`, verbatim from the annotation.
    pub rotation: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The container has no visible process yet. Retryable: the runtime may
    /// not have started it, or the cgroup entry may not be published.
    #[error("no process found for container {container_id}")]
    PidNotFound { container_id: String },
}

/// Seam for spawning the capture child, so tests can substitute a harmless
/// process for the real `nsenter`/`tcpdump` pipeline.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, pid: i32, rotation: &str, pcap_path: &Path) -> std::io::Result<Child>;
}

/// Launches `tcpdump` inside the target's network namespace.
pub struct NsenterLauncher;

fn nsenter_args(pid: i32, rotation: &str, pcap_path: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-t".into(),
        pid.to_string().into(),
        "-n".into(),
        "--".into(),
    ];
    // -C 1 rotates at 1 MB; -W caps the rotation ring; -Z keeps tcpdump
    // running as root so it can write under the capture directory.
    args.extend(
        ["tcpdump", "-Z", "root", "-i", "any", "-C", "1", "-W", rotation, "-w"]
            .into_iter()
            .map(OsString::from),
    );
    args.push(pcap_path.as_os_str().to_os_string());
    args
}

impl ProcessLauncher for NsenterLauncher {
    fn launch(&self, pid: i32, rotation: &str, pcap_path: &Path) -> std::io::Result<Child> {
        let mut cmd = Command::new("nsenter");
        cmd.args(nsenter_args(pid, rotation, pcap_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            // Forward tcpdump's diagnostics to the agent's own stderr.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd.spawn()
    }
}

struct RunningCapture {
    uid: String,
    cancel: CancellationToken,
    artifact_prefix: String,
}

type CaptureTable = Arc<Mutex<HashMap<Identity, RunningCapture>>>;

/// The operations the reconcile loop drives. Implemented by
/// [`CaptureSupervisor`]; tests substitute recording fakes.
#[async_trait]
pub trait CaptureLifecycle: Send + Sync {
    /// Ensure a capture matching `req` is running. No-op if one already runs
    /// for the same identity and UID.
    async fn sync(&self, req: CaptureRequest) -> Result<(), CaptureError>;

    /// Cancel and clean up the capture for `identity`, if any.
    async fn stop_by_identity(&self, identity: &Identity);
}

/// Owns every running capture on this node.
///
/// The table mutex is held only for O(1) map operations; proc scanning,
/// child spawning, and artifact removal all happen outside it.
pub struct CaptureSupervisor {
    captures: CaptureTable,
    capture_dir: PathBuf,
    proc_root: PathBuf,
    launcher: Arc<dyn ProcessLauncher>,
    tasks: TaskTracker,
}

impl CaptureSupervisor {
    pub fn new(capture_dir: PathBuf, proc_root: PathBuf) -> Self {
        Self::with_launcher(capture_dir, proc_root, Arc::new(NsenterLauncher))
    }

    pub fn with_launcher(
        capture_dir: PathBuf,
        proc_root: PathBuf,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            captures: Arc::new(Mutex::new(HashMap::new())),
            capture_dir,
            proc_root,
            launcher,
            tasks: TaskTracker::new(),
        }
    }

    /// Identities with a live table entry, for requeueing after a relist.
    pub fn tracked_identities(&self) -> Vec<Identity> {
        self.captures.lock().unwrap().keys().cloned().collect()
    }

    /// Cancel every running capture, remove its artifacts, and wait for all
    /// wait tasks to reap their children.
    pub async fn shutdown(&self) {
        let drained: Vec<RunningCapture> = {
            let mut table = self.captures.lock().unwrap();
            table.drain().map(|(_, capture)| capture).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "stopping all captures for shutdown");
        }
        for capture in &drained {
            capture.cancel.cancel();
        }
        for capture in &drained {
            self.cleanup_artifacts(&capture.artifact_prefix);
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Drop the reservation made by `sync` if it is still ours.
    fn release_reservation(&self, identity: &Identity, uid: &str) {
        let mut table = self.captures.lock().unwrap();
        if table.get(identity).is_some_and(|c| c.uid == uid) {
            table.remove(identity);
        }
    }

    /// Unlink `<prefix>.pcap` and any rotated siblings (`<prefix>.pcap1`,
    /// ...). Failures are logged and tolerated; orphans can be removed by
    /// the operator.
    fn cleanup_artifacts(&self, prefix: &str) {
        let file_prefix = format!("{prefix}.pcap");
        let entries = match std::fs::read_dir(&self.capture_dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    dir = %self.capture_dir.display(),
                    error = %err,
                    "failed to scan capture directory for cleanup"
                );
                return;
            }
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(&file_prefix) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => info!(file = %entry.path().display(), "removed capture artifact"),
                Err(err) => warn!(
                    file = %entry.path().display(),
                    error = %err,
                    "failed to remove capture artifact"
                ),
            }
        }
    }
}

#[async_trait]
impl CaptureLifecycle for CaptureSupervisor {
    async fn sync(&self, req: CaptureRequest) -> Result<(), CaptureError> {
        // A different UID under the same identity means the pod was deleted
        // and recreated; tear the old capture down before starting over.
        let stale = {
            let mut table = self.captures.lock().unwrap();
            match table.get(&req.identity) {
                Some(existing) if existing.uid == req.uid => return Ok(()),
                Some(_) => table.remove(&req.identity),
                None => None,
            }
        };
        if let Some(old) = stale {
            info!(pod = %req.identity, "pod recreated under the same name, replacing capture");
            old.cancel.cancel();
            self.cleanup_artifacts(&old.artifact_prefix);
        }

        // Reserve the table slot before doing any slow work so concurrent
        // syncs for the same identity cannot double-start.
        let cancel = CancellationToken::new();
        let prefix = req.identity.artifact_prefix();
        {
            let mut table = self.captures.lock().unwrap();
            table.insert(
                req.identity.clone(),
                RunningCapture {
                    uid: req.uid.clone(),
                    cancel: cancel.clone(),
                    artifact_prefix: prefix.clone(),
                },
            );
        }

        let Some((_, container_id)) = req.container_id.split_once("://") else {
            error!(
                pod = %req.identity,
                container_id = %req.container_id,
                "invalid container ID format"
            );
            self.release_reservation(&req.identity, &req.uid);
            return Ok(());
        };

        let Some(pid) = discovery::find_pid_by_container_id(&self.proc_root, container_id) else {
            debug!(pod = %req.identity, container_id, "container process not visible yet");
            self.release_reservation(&req.identity, &req.uid);
            return Err(CaptureError::PidNotFound {
                container_id: container_id.to_string(),
            });
        };

        let pcap_path = self.capture_dir.join(format!("{prefix}.pcap"));
        let child = match self.launcher.launch(pid, &req.rotation, &pcap_path) {
            Ok(child) => child,
            Err(err) => {
                error!(pod = %req.identity, error = %err, "failed to spawn capture process");
                self.release_reservation(&req.identity, &req.uid);
                return Ok(());
            }
        };

        info!(
            pod = %req.identity,
            pid,
            rotation = %req.rotation,
            file = %pcap_path.display(),
            "started capture"
        );

        let captures = Arc::clone(&self.captures);
        let identity = req.identity.clone();
        let uid = req.uid.clone();
        self.tasks
            .spawn(supervise_child(child, cancel, identity, uid, captures));

        Ok(())
    }

    async fn stop_by_identity(&self, identity: &Identity) {
        let removed = self.captures.lock().unwrap().remove(identity);
        let Some(capture) = removed else {
            return;
        };
        info!(pod = %identity, "stopping capture");
        capture.cancel.cancel();
        self.cleanup_artifacts(&capture.artifact_prefix);
    }
}

/// Owns the child handle for one capture. Ends either when cancelled (stop
/// path: terminate and reap the child) or when the child exits on its own
/// (clear the table entry so the next reconcile can restart; artifacts stay
/// on disk until the next stop).
async fn supervise_child(
    mut child: Child,
    cancel: CancellationToken,
    identity: Identity,
    uid: String,
    captures: CaptureTable,
) {
    let status = tokio::select! {
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status),
    };

    match status {
        None => terminate(&mut child, &identity).await,
        Some(status) => {
            match status {
                Ok(status) => {
                    warn!(pod = %identity, %status, "capture process exited on its own")
                }
                Err(err) => {
                    error!(pod = %identity, error = %err, "failed waiting on capture process")
                }
            }
            let mut table = captures.lock().unwrap();
            if table.get(&identity).is_some_and(|c| c.uid == uid) {
                table.remove(&identity);
            }
        }
    }
}

/// SIGTERM, bounded wait, SIGKILL fallback. Always reaps the child.
async fn terminate(child: &mut Child, identity: &Identity) {
    if let Some(pid) = child.id() {
        if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(pod = %identity, pid, error = %err, "failed to send SIGTERM to capture process");
        }
    }
    match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(pod = %identity, %status, "capture process stopped"),
        Ok(Err(err)) => error!(pod = %identity, error = %err, "failed waiting on capture process"),
        Err(_) => {
            warn!(
                pod = %identity,
                timeout_secs = STOP_TIMEOUT.as_secs(),
                "capture process ignored SIGTERM, sending SIGKILL"
            );
            if let Err(err) = child.kill().await {
                error!(pod = %identity, error = %err, "failed to SIGKILL capture process");
            }
        }
    }
}
