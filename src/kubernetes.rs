//! Node-scoped pod watching.
//!
//! Runs a `kube` watcher restricted by field selector to pods scheduled on
//! this node, mirrors every event into the reflector store, and enqueues the
//! pod's `namespace/name` key for the reconcile worker. A global watch would
//! not scale; the API server does the filtering.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::reflector::store::Writer;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureSupervisor, Identity};
use crate::workqueue::WorkQueue;

/// Watch pods on `node_name` until `shutdown` fires, feeding the store
/// writer and the work queue. Sends `true` on `synced` once the initial
/// listing is complete.
pub async fn run_pod_watcher(
    client: Client,
    node_name: String,
    mut writer: Writer<Pod>,
    queue: WorkQueue,
    supervisor: Arc<CaptureSupervisor>,
    synced: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    let pods: Api<Pod> = Api::all(client);
    let config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
    let stream = watcher::watcher(pods, config);
    tokio::pin!(stream);

    info!(node = %node_name, "pod watcher started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("pod watcher shutting down");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(event)) => {
                        writer.apply_watcher_event(&event);
                        handle_event(&event, &queue, &supervisor, &synced);
                    }
                    // The watcher restarts the watch internally with backoff;
                    // errors here are informational.
                    Some(Err(err)) => warn!(error = %err, "pod watch error"),
                    None => {
                        warn!("pod watch stream ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Translate a watch event into work-queue keys.
///
/// Deletes enqueue the same key as adds and updates: the worker decides what
/// to do from the store, so a key whose pod is gone reconciles to a stop.
/// After each completed re-list, every identity with a running capture is
/// requeued as well - a pod deleted while the watch was down never produces
/// a delete event, and this is what converges its capture.
pub fn handle_event(
    event: &Event<Pod>,
    queue: &WorkQueue,
    supervisor: &CaptureSupervisor,
    synced: &watch::Sender<bool>,
) {
    match event {
        Event::Apply(pod) | Event::InitApply(pod) | Event::Delete(pod) => {
            if let Some(identity) = pod_identity(pod) {
                queue.add(&identity.key());
            } else {
                warn!("pod event without namespace/name, ignoring");
            }
        }
        Event::Init => debug!("pod relist started"),
        Event::InitDone => {
            for identity in supervisor.tracked_identities() {
                queue.add(&identity.key());
            }
            let _ = synced.send(true);
            debug!("pod relist complete");
        }
    }
}

fn pod_identity(pod: &Pod) -> Option<Identity> {
    let namespace = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    Some(Identity::new(namespace, name))
}
