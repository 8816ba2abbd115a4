//! Single-slot execution gate.
//!
//! Two independent signals decide whether a job may start:
//! - the slot, an owned async mutex that serializes every job run in this
//!   process;
//! - the probe, a best-effort query against the container runtime for a
//!   running container with the well-known name. It catches containers left
//!   behind by a previous process that crashed or restarted mid-run.

use std::{future::Future, sync::Arc};

use tokio::sync::Mutex;

use super::container::{ContainerRuntime, LifecycleError, stop_and_remove};

/// Occupancy of the execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Occupied,
}

#[derive(Clone)]
pub struct ExecutionGate {
    slot: Arc<Mutex<()>>,
    runtime: Arc<dyn ContainerRuntime>,
    container_name: String,
}

impl ExecutionGate {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_name: impl Into<String>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(())),
            runtime,
            container_name: container_name.into(),
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Whether the well-known job container is running right now.
    ///
    /// Does not touch the slot. Runtime errors are logged and read as "not
    /// running" so an unreachable runtime surfaces later as a run failure.
    pub async fn probe(&self) -> bool {
        match self.runtime.is_running(&self.container_name).await {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!(
                    container = %self.container_name,
                    error = %e,
                    "Container probe failed, assuming no job is running"
                );
                false
            }
        }
    }

    /// Stop and remove the well-known container, whoever started it.
    ///
    /// Used at startup to clear containers orphaned by a previous process and
    /// at shutdown to tear down the run this process is abandoning.
    pub async fn remove_container(&self) -> Result<(), LifecycleError> {
        stop_and_remove(self.runtime.as_ref(), &self.container_name).await
    }

    /// Current slot occupancy, without waiting.
    pub fn slot_state(&self) -> SlotState {
        match self.slot.try_lock() {
            Ok(_) => SlotState::Idle,
            Err(_) => SlotState::Occupied,
        }
    }

    /// Wait for the slot, run `f` while holding it, then release it.
    ///
    /// The slot is released when `f` completes, panics or is dropped. Waiters
    /// are served in FIFO order with no timeout.
    pub async fn run_exclusively<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.slot.lock().await;
        tracing::debug!(container = %self.container_name, "Execution slot acquired");
        let result = f().await;
        tracing::debug!(container = %self.container_name, "Execution slot released");
        result
    }
}
