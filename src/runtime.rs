//! Instance execution interface.
//!
//! The launcher hands a prepared runtime directory to an [`InstanceRunner`]
//! and later asks it to stop the instance. How the workload is isolated
//! (container, unikernel, microVM) is entirely up to the runner.
//!
//! [`OciRunner`] implements the runner contract on top of any backend that
//! follows the OCI runtime lifecycle:
//!
//! ```text
//! start_instance:  create(id, bundle) → start(id) → state(id) == running
//! stop_instance:   kill(id, TERM) → wait ≤ grace → kill(id, KILL) → delete(id)
//! ```

use crate::constants::DEFAULT_GRACE_PERIOD;
use crate::error::{Error, Result};
use crate::types::RunStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Instance Runner
// =============================================================================

/// Execution collaborator.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    /// Starts an instance from a prepared runtime directory.
    ///
    /// Start failures are reported in the returned status, not as an error.
    async fn start_instance(&self, instance_id: &str, runtime_dir: &Path) -> RunStatus;

    /// Stops an instance.
    async fn stop_instance(&self, instance_id: &str) -> Result<()>;
}

/// Receiver of asynchronous run-state changes reported by a runner
/// (for example an instance that crashed after it was started).
#[async_trait]
pub trait RunStatusReceiver: Send + Sync {
    /// Updates the run status of the given instances.
    async fn update_run_status(&self, statuses: &[RunStatus]) -> Result<()>;
}

// =============================================================================
// OCI Runtime Backend
// =============================================================================

/// OCI Runtime Spec container status.
///
/// Ref: https://github.com/opencontainers/runtime-spec/blob/main/runtime.md#state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is being created.
    Creating,
    /// Container has been created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container has stopped.
    Stopped,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Container state as reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: String,
}

/// Signal to send to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Backend following the OCI runtime lifecycle.
#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Creates a container from an OCI bundle (`config.json` + rootfs).
    async fn create(&self, id: &str, bundle: &Path) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Gets the state of a container.
    ///
    /// Returns [`Error::NotFound`] for unknown containers.
    async fn state(&self, id: &str) -> Result<ContainerState>;

    /// Sends a signal to all processes of a container.
    async fn kill(&self, id: &str, signal: Signal) -> Result<()>;

    /// Deletes a container; `force` deletes even if still running.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;
}

/// [`InstanceRunner`] over an [`OciRuntime`] backend.
pub struct OciRunner<R> {
    runtime: R,
    grace_period: Duration,
    poll_interval: Duration,
}

impl<R: OciRuntime> OciRunner<R> {
    /// Creates a runner with the default grace period.
    pub fn new(runtime: R) -> Self {
        Self::with_grace_period(runtime, DEFAULT_GRACE_PERIOD)
    }

    /// Creates a runner with a specific grace period between SIGTERM and
    /// SIGKILL.
    pub fn with_grace_period(runtime: R, grace_period: Duration) -> Self {
        Self {
            runtime,
            grace_period,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Returns the backend.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    async fn start(&self, id: &str, bundle: &Path) -> Result<()> {
        self.runtime.create(id, bundle).await?;

        if let Err(e) = self.runtime.start(id).await {
            // Roll back the created container so a retry starts clean.
            let _ = self.runtime.delete(id, true).await;
            return Err(e);
        }

        let state = self.runtime.state(id).await?;
        if state.status != ContainerStatus::Running {
            let _ = self.runtime.delete(id, true).await;
            return Err(Error::collaborator(
                self.runtime.name(),
                format!("container '{id}' is {} after start", state.status),
            ));
        }

        Ok(())
    }

    /// Waits until the container stops or the grace period elapses.
    async fn wait_stopped(&self, id: &str) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + self.grace_period;
        loop {
            match self.runtime.state(id).await {
                Ok(state) if state.status == ContainerStatus::Stopped => return Ok(true),
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(true),
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl<R: OciRuntime> InstanceRunner for OciRunner<R> {
    async fn start_instance(&self, instance_id: &str, runtime_dir: &Path) -> RunStatus {
        debug!(
            runtime = self.runtime.name(),
            instance_id,
            bundle = %runtime_dir.display(),
            "Starting container"
        );

        match self.start(instance_id, runtime_dir).await {
            Ok(()) => {
                info!(runtime = self.runtime.name(), instance_id, "Container running");
                RunStatus::active(instance_id)
            }
            Err(e) => {
                warn!(runtime = self.runtime.name(), instance_id, error = %e, "Container start failed");
                RunStatus::failed(instance_id, e.to_status())
            }
        }
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        match self.runtime.kill(instance_id, Signal::Term).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(instance_id, "Container already gone");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        if !self.wait_stopped(instance_id).await? {
            warn!(
                instance_id,
                grace_period = ?self.grace_period,
                "Container ignored SIGTERM, sending SIGKILL"
            );
            self.runtime.kill(instance_id, Signal::Kill).await?;
        }

        self.runtime.delete(instance_id, true).await?;
        info!(runtime = self.runtime.name(), instance_id, "Container stopped");
        Ok(())
    }
}
