//! Entry points for the three launcher verbs.
//!
//! Each call owns one [`VmInstance`] from construction until the hypervisor
//! has exited, and never leaves a live subprocess behind.

use std::path::PathBuf;
use std::process::ExitStatus;

use crate::address::AddressLease;
use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::instance::VmInstance;
use crate::snapshot::{
    SnapshotArtifact, SnapshotCoordinator, SnapshotOptions, SnapshotReport, SnapshotStep,
};

/// Result of a restore: the load report and the final exit status.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub report: SnapshotReport,
    pub exit_status: ExitStatus,
}

/// Drives launch, snapshot and restore for one [`VmConfig`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: VmConfig,
}

impl Orchestrator {
    pub fn new(config: VmConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Boot a new microVM and block until its process exits.
    ///
    /// The socket file is removed on every return path. A non-zero exit is
    /// returned as the status, not as an error.
    pub async fn launch_fresh(&self) -> Result<ExitStatus> {
        self.config.validate()?;
        let lease = self.config.socket_path.bind()?;
        let mut instance = VmInstance::new(self.config.clone());

        let result = match boot(&mut instance).await {
            Ok(()) => {
                tracing::info!(
                    socket = %self.config.socket_path,
                    pid = ?instance.pid(),
                    "microVM running"
                );
                wait_or_interrupt(&mut instance).await
            }
            Err(e) => {
                abandon(&mut instance).await;
                Err(e)
            }
        };
        finish(lease, result)
    }

    /// Snapshot the hypervisor already serving the configured socket into
    /// `<artifact_base>.mem` and `<artifact_base>.file`.
    ///
    /// The instance is not owned by this call: it is left running and its
    /// socket is left in place.
    pub async fn create_snapshot_for(
        &self,
        artifact_base: impl Into<PathBuf>,
        options: SnapshotOptions,
    ) -> Result<SnapshotReport> {
        let artifact = SnapshotArtifact::from_base(artifact_base);
        let mut instance = VmInstance::connect_existing(self.config.clone()).await?;
        SnapshotCoordinator::new(&mut instance)
            .create(&artifact, options)
            .await
    }

    /// Restore `<artifact_base>` into a new hypervisor process and block
    /// until it exits.
    pub async fn restore_from_snapshot(
        &self,
        artifact_base: impl Into<PathBuf>,
    ) -> Result<RestoreOutcome> {
        let artifact = SnapshotArtifact::from_base(artifact_base);
        let lease = self.config.socket_path.bind()?;
        let mut instance = VmInstance::new(self.config.for_restore());

        let result = match SnapshotCoordinator::new(&mut instance).load(&artifact).await {
            Ok(report) => {
                tracing::info!(
                    socket = %self.config.socket_path,
                    pid = ?instance.pid(),
                    "microVM restored"
                );
                wait_or_interrupt(&mut instance)
                    .await
                    .map(|exit_status| RestoreOutcome {
                        report,
                        exit_status,
                    })
                    .map_err(|e| e.at_step(SnapshotStep::Wait))
            }
            Err(e) => {
                abandon(&mut instance).await;
                Err(e)
            }
        };
        finish(lease, result)
    }
}

async fn boot(instance: &mut VmInstance) -> Result<()> {
    instance.spawn().await?;
    instance.configure().await?;
    instance.start().await
}

/// Wait for the hypervisor to exit, terminating it on Ctrl-C.
async fn wait_or_interrupt(instance: &mut VmInstance) -> Result<ExitStatus> {
    tokio::select! {
        status = instance.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, terminating hypervisor");
            instance
                .terminate()
                .await?
                .ok_or_else(|| Error::Other("no supervised hypervisor process".to_owned()))
        }
    }
}

/// Terminate whatever was spawned before a failed protocol step.
async fn abandon(instance: &mut VmInstance) {
    if instance.pid().is_none() {
        return;
    }
    if let Err(e) = instance.terminate().await {
        tracing::warn!(error = %e, "failed to terminate hypervisor");
    }
}

fn finish<T>(mut lease: AddressLease, result: Result<T>) -> Result<T> {
    let released = lease.release();
    match result {
        Ok(value) => released.map(|()| value),
        Err(e) => {
            if let Err(release) = released {
                tracing::warn!(socket = %lease.address(), error = %release, "failed to remove API socket");
            }
            Err(e)
        }
    }
}
