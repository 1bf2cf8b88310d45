//! On-demand pod packet captures for a single Kubernetes node.
//!
//! The agent watches pods scheduled on its node and reconciles the set of
//! pods carrying the `tcpdump.antrea.io` annotation against the set of
//! capture processes it is running. A capture enters the pod's network
//! namespace (`nsenter -t <pid> -n`) and runs `tcpdump` with file rotation;
//! removing the annotation, deleting the pod, or shutting the agent down
//! terminates the capture and removes its artifact files.
//!
//! ## Architecture
//!
//! 1. **Discovery** (`discovery` module) - Resolves a container runtime ID to
//!    a host PID by scanning `/proc/*/cgroup`.
//!
//! 2. **Capture supervisor** (`capture` module) - Owns one capture process
//!    per pod, with cancellation and artifact cleanup.
//!
//! 3. **Controller** (`controller` module) - Single worker draining a
//!    rate-limited work queue (`workqueue` module) fed by the pod watcher
//!    (`kubernetes` module), deciding start/stop/noop per pod.
//!
//! ## Usage
//!
//! Run as a binary on a Kubernetes node (typically via DaemonSet with host
//! PID visibility):
//!
//! ```bash
//! NODE_NAME=$(hostname) antrea-capture-agent \
//!   --capture-dir /var/log/antrea-captures
//! ```

pub mod capture;
pub mod controller;
pub mod discovery;
pub mod kubernetes;
pub mod workqueue;
