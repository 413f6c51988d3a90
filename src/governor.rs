//! Run-wide concurrency limits.
//!
//! Two independent pools: `sandbox_slots` bounds live sample environment
//! sets, `exec_slots` bounds commands in flight across every environment.
//! Waiters queue in FIFO order; cancellation wakes them with
//! [`SandboxError::Interrupted`].

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::sandbox::{SandboxError, SandboxResult};

#[derive(Debug, Clone)]
pub(crate) struct Governor {
    sandbox_slots: Arc<Semaphore>,
    exec_slots: Arc<Semaphore>,
    sandbox_bound: usize,
    exec_bound: usize,
}

impl Governor {
    pub fn new(sandbox_bound: usize, exec_bound: usize) -> Self {
        let sandbox_bound = sandbox_bound.max(1);
        let exec_bound = exec_bound.max(1);
        Self {
            sandbox_slots: Arc::new(Semaphore::new(sandbox_bound)),
            exec_slots: Arc::new(Semaphore::new(exec_bound)),
            sandbox_bound,
            exec_bound,
        }
    }

    pub fn from_config(run: &RunConfig) -> Self {
        Self::new(run.sandbox_slots(), run.exec_slots())
    }

    /// Waits for a sandbox slot. The permit is held until the sample's set
    /// is released or orphaned.
    pub async fn acquire_sandbox(&self, cancel: &CancellationToken) -> SandboxResult<OwnedSemaphorePermit> {
        acquire(&self.sandbox_slots, cancel).await
    }

    /// Waits for an exec slot. Drop the permit when the process exits.
    pub async fn acquire_exec(&self, cancel: &CancellationToken) -> SandboxResult<OwnedSemaphorePermit> {
        acquire(&self.exec_slots, cancel).await
    }

    pub fn sandbox_bound(&self) -> usize {
        self.sandbox_bound
    }

    pub fn exec_bound(&self) -> usize {
        self.exec_bound
    }

    pub fn sandboxes_in_use(&self) -> usize {
        self.sandbox_bound - self.sandbox_slots.available_permits()
    }

    pub fn execs_in_flight(&self) -> usize {
        self.exec_bound - self.exec_slots.available_permits()
    }
}

async fn acquire(
    slots: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> SandboxResult<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SandboxError::Interrupted),
        permit = Arc::clone(slots).acquire_owned() => {
            permit.map_err(|_| SandboxError::Interrupted)
        }
    }
}
