//! Reconciliation of observed pod state into capture lifecycle operations.
//!
//! A single worker drains the work queue, looks each key up in the local pod
//! store, and applies the decision table:
//!
//! | observed state                               | action            |
//! |----------------------------------------------|-------------------|
//! | absent from the store                        | stop              |
//! | no capture annotation                        | stop              |
//! | deletion timestamp set                       | stop              |
//! | annotated, container status missing          | retryable error   |
//! | annotated, container status present          | sync              |
//!
//! Only retryable errors reach the queue; malformed input is logged and
//! absorbed because retrying cannot fix it.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureError, CaptureLifecycle, CaptureRequest, Identity, ANNOTATION_KEY};
use crate::workqueue::WorkQueue;

/// Requeues per key before the worker gives up on it.
const MAX_REQUEUES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("container status not yet reported for pod {key}")]
    ContainerStatusPending { key: String },
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

pub struct Controller<C> {
    store: Store<Pod>,
    supervisor: Arc<C>,
}

impl<C: CaptureLifecycle> Controller<C> {
    pub fn new(store: Store<Pod>, supervisor: Arc<C>) -> Self {
        Self { store, supervisor }
    }

    /// Reconcile one `namespace/name` key against the cached pod store.
    pub async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        let Some(identity) = Identity::parse(key) else {
            error!(key, "malformed work item key, dropping");
            return Ok(());
        };

        let obj_ref = ObjectRef::new(&identity.name).within(&identity.namespace);
        let Some(pod) = self.store.get(&obj_ref) else {
            debug!(pod = %identity, "pod absent from store");
            self.supervisor.stop_by_identity(&identity).await;
            return Ok(());
        };

        match capture_request(&identity, &pod)? {
            Some(request) => Ok(self.supervisor.sync(request).await?),
            None => {
                self.supervisor.stop_by_identity(&identity).await;
                Ok(())
            }
        }
    }
}

/// Derive a [`CaptureRequest`] from a pod snapshot. `Ok(None)` means no
/// capture should run (annotation absent or pod terminating); the pending
/// error means the annotation is present but the runtime has not published a
/// container ID yet, which resolves itself once the container starts.
fn capture_request(
    identity: &Identity,
    pod: &Pod,
) -> Result<Option<CaptureRequest>, ReconcileError> {
    let meta = &pod.metadata;
    let Some(rotation) = meta
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_KEY))
    else {
        return Ok(None);
    };
    if meta.deletion_timestamp.is_some() {
        return Ok(None);
    }

    let container_id = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|status| status.container_id.clone())
        .ok_or_else(|| ReconcileError::ContainerStatusPending {
            key: identity.key(),
        })?;

    Ok(Some(CaptureRequest {
        identity: identity.clone(),
        uid: meta.uid.clone().unwrap_or_default(),
        container_id,
        rotation: rotation.clone(),
    }))
}

/// Worker loop: drains the queue until shutdown, retrying failed keys with
/// rate-limited backoff up to [`MAX_REQUEUES`] times.
pub async fn run_worker<C: CaptureLifecycle>(controller: Arc<Controller<C>>, queue: WorkQueue) {
    info!("reconcile worker started");
    while let Some(key) = queue.get().await {
        match controller.reconcile(&key).await {
            Ok(()) => queue.forget(&key),
            Err(err) => {
                if queue.num_requeues(&key) < MAX_REQUEUES {
                    warn!(key = %key, error = %err, "reconcile failed, requeuing");
                    queue.add_rate_limited(&key);
                } else {
                    error!(key = %key, error = %err, "reconcile failed too many times, dropping");
                    queue.forget(&key);
                }
            }
        }
        queue.done(&key);
    }
    info!("reconcile worker stopped");
}
