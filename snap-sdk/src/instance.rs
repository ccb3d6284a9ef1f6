use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::client::ControlClient;
use crate::config::VmConfig;
use crate::error::{Error, Result};
use crate::process::{HypervisorProcess, ProcessBuilder};
use crate::snapshot::{SnapshotArtifact, SnapshotType};
use crate::state::{Lifecycle, Transition, VmState};

/// Live handle to one microVM: its configuration, lifecycle state,
/// supervised process and control channel.
///
/// Every control operation checks the lifecycle first, sends the request,
/// and only then records the transition. The instance has a single owner,
/// so `&mut self` is the only synchronisation the state needs.
#[derive(Debug)]
pub struct VmInstance {
    config: VmConfig,
    lifecycle: Lifecycle,
    process: Option<HypervisorProcess>,
    client: Option<ControlClient>,
    /// Set when a resume sent on this VM's behalf from outside the handle
    /// (an abandoned snapshot) has been accepted by the hypervisor.
    resumed_elsewhere: Arc<AtomicBool>,
}

impl VmInstance {
    /// A fresh, unconfigured instance with no process yet.
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::new(),
            process: None,
            client: None,
            resumed_elsewhere: Arc::default(),
        }
    }

    /// Wrap a hypervisor this handle did not spawn.
    pub fn attach(config: VmConfig, client: ControlClient, observed: VmState) -> Self {
        Self {
            config,
            lifecycle: Lifecycle::observed(observed),
            process: None,
            client: Some(client),
            resumed_elsewhere: Arc::default(),
        }
    }

    /// Connect to the hypervisor already serving `config.socket_path` and
    /// seed the lifecycle from the state it reports.
    pub async fn connect_existing(config: VmConfig) -> Result<Self> {
        let client = ControlClient::connect(&config.socket_path, &config.channel).await?;
        let info = client.describe().await?;
        let observed = VmState::from_reported(&info.state).ok_or_else(|| Error::ControlChannel {
            operation: "describe",
            detail: format!("unknown instance state {:?}", info.state),
        })?;
        tracing::debug!(socket = %config.socket_path, id = %info.id, state = %observed, "attached to hypervisor");
        Ok(Self::attach(config, client, observed))
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn state(&self) -> VmState {
        match self.lifecycle.current() {
            VmState::Paused if self.resumed_elsewhere.load(Ordering::Acquire) => VmState::Running,
            current => current,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(HypervisorProcess::pid)
    }

    pub fn client(&self) -> Option<&ControlClient> {
        self.client.as_ref()
    }

    /// Flag to raise once a detached resume of this VM succeeds.
    pub(crate) fn resume_flag(&self) -> Arc<AtomicBool> {
        self.resumed_elsewhere.clone()
    }

    /// Fold a detached resume into the lifecycle.
    fn reconcile(&mut self) {
        if self.resumed_elsewhere.swap(false, Ordering::AcqRel)
            && self.lifecycle.current() == VmState::Paused
            && let Err(e) = self.lifecycle.apply(Transition::Resume)
        {
            tracing::warn!(error = %e, "failed to record detached resume");
        }
    }

    fn connected(&self, operation: &'static str) -> Result<&ControlClient> {
        self.client
            .as_ref()
            .ok_or(Error::NotConnected { operation })
    }

    // =========================================================================
    // Process
    // =========================================================================

    /// Spawn the hypervisor and wait for its control channel.
    ///
    /// If the channel never becomes ready the process is terminated before
    /// the error is returned.
    pub async fn spawn(&mut self) -> Result<()> {
        if self.process.is_some() || self.client.is_some() {
            return Err(Error::Other(format!(
                "hypervisor for {} already started",
                self.config.socket_path
            )));
        }

        let mut process = ProcessBuilder::from_config(&self.config).spawn()?;

        let connected = tokio::select! {
            connected = ControlClient::connect(&self.config.socket_path, &self.config.channel) => connected,
            exited = process.wait() => {
                let status = exited?;
                tracing::warn!(%status, "hypervisor exited before its control channel was ready");
                return Err(Error::ProcessExitUnexpected(status));
            }
        };

        match connected {
            Ok(client) => {
                self.process = Some(process);
                self.client = Some(client);
                Ok(())
            }
            Err(e) => {
                if let Ok(Some(status)) = process.try_status() {
                    return Err(Error::ProcessExitUnexpected(status));
                }
                if let Err(term) = process.terminate().await {
                    tracing::warn!(error = %term, "failed to terminate hypervisor after connect failure");
                }
                Err(e)
            }
        }
    }

    /// Block until the supervised process exits and record the outcome.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.reconcile();
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| Error::Other("no supervised hypervisor process".to_owned()))?;
        let status = process.wait().await?;
        let state = self.lifecycle.observe_exit(status.success());
        tracing::info!(%status, %state, "hypervisor exited");
        Ok(status)
    }

    /// Terminate the supervised process, if any, and mark the VM stopped.
    pub async fn terminate(&mut self) -> Result<Option<ExitStatus>> {
        self.reconcile();
        let status = match &mut self.process {
            Some(process) => Some(process.terminate().await?),
            None => None,
        };
        self.lifecycle.apply(Transition::Stop)?;
        Ok(status)
    }

    // =========================================================================
    // Control Operations
    // =========================================================================

    /// Validate and send the pre-boot configuration.
    pub async fn configure(&mut self) -> Result<()> {
        self.reconcile();
        let transition = Transition::Configure {
            validation_disabled: self.config.disable_validation,
        };
        self.lifecycle.check(transition)?;
        self.config.validate()?;
        self.connected("configure")?.configure(&self.config).await?;
        self.lifecycle.apply(transition)?;
        Ok(())
    }

    /// Boot the configured microVM.
    pub async fn start(&mut self) -> Result<()> {
        self.reconcile();
        self.lifecycle.check(Transition::Start)?;
        self.connected("start")?.start().await?;
        self.lifecycle.apply(Transition::Start)?;
        Ok(())
    }

    pub async fn pause(&mut self) -> Result<()> {
        self.reconcile();
        self.lifecycle.check(Transition::Pause)?;
        self.connected("pause")?.pause().await?;
        self.lifecycle.apply(Transition::Pause)?;
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        self.reconcile();
        self.lifecycle.check(Transition::Resume)?;
        self.connected("resume")?.resume().await?;
        self.lifecycle.apply(Transition::Resume)?;
        Ok(())
    }

    /// Capture a snapshot. The VM must already be paused; use
    /// [`SnapshotCoordinator`](crate::snapshot::SnapshotCoordinator) to
    /// pause and resume around the capture.
    pub async fn create_snapshot(
        &mut self,
        artifact: &SnapshotArtifact,
        snapshot_type: SnapshotType,
    ) -> Result<()> {
        self.reconcile();
        self.lifecycle.check(Transition::CreateSnapshot)?;
        self.connected("create_snapshot")?
            .create_snapshot(artifact, snapshot_type)
            .await?;
        self.lifecycle.apply(Transition::CreateSnapshot)?;
        Ok(())
    }

    /// Load a snapshot into a freshly configured restore instance. The VM
    /// is left paused.
    pub async fn load_snapshot(&mut self, artifact: &SnapshotArtifact) -> Result<()> {
        self.reconcile();
        self.lifecycle.check(Transition::LoadSnapshot)?;
        self.connected("load_snapshot")?
            .load_snapshot(artifact, self.config.track_dirty_pages, false)
            .await?;
        self.lifecycle.apply(Transition::LoadSnapshot)?;
        Ok(())
    }

    /// Ask the guest to shut down. The state changes once the process exits.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.reconcile();
        if !self.state().is_live() {
            return Err(Error::IllegalStateTransition {
                current: self.state(),
                attempted: Transition::Stop,
            });
        }
        self.connected("shutdown")?.shutdown().await
    }
}
