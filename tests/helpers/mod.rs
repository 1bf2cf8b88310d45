//! Shared fixtures for the end-to-end pipeline tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::runtime::reflector;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::Event;
use nix::sys::signal;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use antrea_capture_agent::capture::{
    CaptureSupervisor, ProcessLauncher, ANNOTATION_KEY,
};
use antrea_capture_agent::controller::{run_worker, Controller};
use antrea_capture_agent::kubernetes;
use antrea_capture_agent::workqueue::WorkQueue;

pub struct LaunchRecord {
    pub target_pid: i32,
    pub rotation: String,
    pub pcap_path: PathBuf,
    pub child_pid: u32,
}

/// Stands in for the nsenter/tcpdump pipeline with a long sleep.
pub struct RecordingLauncher {
    launches: Mutex<Vec<LaunchRecord>>,
}

impl RecordingLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
        })
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn record(&self, index: usize) -> (i32, String, PathBuf, u32) {
        let launches = self.launches.lock().unwrap();
        let record = &launches[index];
        (
            record.target_pid,
            record.rotation.clone(),
            record.pcap_path.clone(),
            record.child_pid,
        )
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn launch(&self, pid: i32, rotation: &str, pcap_path: &Path) -> std::io::Result<Child> {
        let child = Command::new("/bin/sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.launches.lock().unwrap().push(LaunchRecord {
            target_pid: pid,
            rotation: rotation.to_string(),
            pcap_path: pcap_path.to_path_buf(),
            child_pid: child.id().unwrap_or(0),
        });
        Ok(child)
    }
}

/// The reconcile pipeline wired up end to end, minus the API server: events
/// are fed through the same store writer and handler the watcher task uses.
pub struct Harness {
    pub queue: WorkQueue,
    pub supervisor: Arc<CaptureSupervisor>,
    pub launcher: Arc<RecordingLauncher>,
    pub capture_dir: PathBuf,
    pub proc_root: PathBuf,
    pub writer: Writer<Pod>,
    pub synced: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn start() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let capture_dir = tmp.path().join("captures");
        let proc_root = tmp.path().join("proc");
        fs::create_dir_all(&capture_dir).unwrap();
        fs::create_dir_all(&proc_root).unwrap();

        let launcher = RecordingLauncher::new();
        let supervisor = Arc::new(CaptureSupervisor::with_launcher(
            capture_dir.clone(),
            proc_root.clone(),
            launcher.clone(),
        ));
        let queue = WorkQueue::new();
        let (store, writer) = reflector::store::<Pod>();
        let (synced, _) = watch::channel(false);

        let controller = Arc::new(Controller::new(store, supervisor.clone()));
        let worker = tokio::spawn(run_worker(controller, queue.clone()));

        Self {
            queue,
            supervisor,
            launcher,
            capture_dir,
            proc_root,
            writer,
            synced,
            worker,
            _tmp: tmp,
        }
    }

    /// Deliver one watch event the way the watcher task would.
    pub fn event(&mut self, event: Event<Pod>) {
        self.writer.apply_watcher_event(&event);
        kubernetes::handle_event(&event, &self.queue, &self.supervisor, &self.synced);
    }

    pub fn add_proc_entry(&self, pid: &str, container_id: &str) {
        let dir = self.proc_root.join(pid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("cgroup"),
            format!("0::/kubepods/cri-containerd-{container_id}.scope\n"),
        )
        .unwrap();
    }

    pub async fn stop(self) {
        self.queue.shut_down();
        let _ = self.worker.await;
        self.supervisor.shutdown().await;
    }
}

pub fn make_pod(
    namespace: &str,
    name: &str,
    uid: &str,
    rotation: Option<&str>,
    container_id: Option<&str>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            annotations: rotation
                .map(|value| BTreeMap::from([(ANNOTATION_KEY.to_string(), value.to_string())])),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            container_statuses: container_id.map(|id| {
                vec![ContainerStatus {
                    name: "app".to_string(),
                    container_id: Some(id.to_string()),
                    ..Default::default()
                }]
            }),
            ..Default::default()
        }),
    }
}

pub fn make_terminating_pod(
    namespace: &str,
    name: &str,
    uid: &str,
    rotation: Option<&str>,
    container_id: Option<&str>,
) -> Pod {
    let mut pod = make_pod(namespace, name, uid, rotation, container_id);
    pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    pod
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub async fn wait_for_pid_gone(pid: u32) {
    wait_for(&format!("pid {pid} to exit"), || !pid_is_alive(pid)).await;
}
