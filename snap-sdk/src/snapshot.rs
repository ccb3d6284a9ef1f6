//! Snapshot artifacts and the create/load protocols.
//!
//! # Creating
//!
//! ```no_run
//! use snap_sdk::{SnapshotArtifact, SnapshotCoordinator, SnapshotOptions, VmConfig, VmInstance};
//!
//! # async fn example() -> snap_sdk::Result<()> {
//! let mut vm = VmInstance::connect_existing(VmConfig::new("/tmp/firecracker.sock")).await?;
//! let report = SnapshotCoordinator::new(&mut vm)
//!     .create(&SnapshotArtifact::from_base("/snapshots/vm1"), SnapshotOptions::default())
//!     .await?;
//! println!("snapshot took {:?}", report.elapsed);
//! # Ok(())
//! # }
//! ```
//!
//! # Loading
//!
//! ```no_run
//! use snap_sdk::{SnapshotArtifact, SnapshotCoordinator, VmConfig, VmInstance};
//!
//! # async fn example() -> snap_sdk::Result<()> {
//! let config = VmConfig::new("/tmp/restored.sock").for_restore();
//! let mut vm = VmInstance::new(config);
//! SnapshotCoordinator::new(&mut vm)
//!     .load(&SnapshotArtifact::from_base("/snapshots/vm1"))
//!     .await?;
//! vm.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::client::ControlClient;
use crate::error::{Error, Result};
use crate::instance::VmInstance;
use crate::state::{Transition, VmState};

/// Suffix of the guest memory image.
pub const MEM_SUFFIX: &str = ".mem";
/// Suffix of the device and vCPU state image.
pub const STATE_SUFFIX: &str = ".file";

/// Kind of snapshot to capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotType {
    /// Self-contained memory image.
    Full,
    /// Only pages dirtied since the previous snapshot. Needs dirty page
    /// tracking enabled in the machine configuration.
    #[default]
    Diff,
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Diff => f.write_str("diff"),
        }
    }
}

/// Per-call options of the create protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    pub snapshot_type: SnapshotType,
}

impl SnapshotOptions {
    pub fn new(snapshot_type: SnapshotType) -> Self {
        Self { snapshot_type }
    }
}

// =============================================================================
// SnapshotArtifact
// =============================================================================

/// The memory and state images of one snapshot, named from a shared base.
///
/// The two files are only meaningful together: pairing is by base path and
/// images from different creation calls must not be mixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotArtifact {
    base: PathBuf,
}

impl SnapshotArtifact {
    pub fn from_base(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<base>.mem`
    pub fn mem_path(&self) -> PathBuf {
        self.with_suffix(MEM_SUFFIX)
    }

    /// `<base>.file`
    pub fn state_path(&self) -> PathBuf {
        self.with_suffix(STATE_SUFFIX)
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut path = OsString::from(self.base.as_os_str());
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Check that both images exist and are non-empty.
    pub fn verify(&self) -> Result<()> {
        for path in [self.mem_path(), self.state_path()] {
            let meta = std::fs::metadata(&path).map_err(|e| Error::InvalidArtifact {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if !meta.is_file() {
                return Err(Error::InvalidArtifact {
                    path,
                    reason: "not a regular file".to_owned(),
                });
            }
            if meta.len() == 0 {
                return Err(Error::InvalidArtifact {
                    path,
                    reason: "file is empty".to_owned(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Protocol steps and reports
// =============================================================================

/// Step of the create or load protocol, attached to failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotStep {
    Verify,
    Pause,
    Capture,
    Resume,
    Spawn,
    Connect,
    Configure,
    Load,
    Wait,
}

impl fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Verify => "verify",
            Self::Pause => "pause",
            Self::Capture => "capture",
            Self::Resume => "resume",
            Self::Spawn => "spawn",
            Self::Connect => "connect",
            Self::Configure => "configure",
            Self::Load => "load",
            Self::Wait => "wait",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful create or load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub artifact: SnapshotArtifact,
    /// Type written by a create; `None` for a load.
    pub snapshot_type: Option<SnapshotType>,
    /// Wall-clock time of the capture or load request itself.
    pub elapsed: Duration,
}

// =============================================================================
// PauseGuard
// =============================================================================

/// Marks a VM as paused on behalf of a snapshot.
///
/// If the guard is dropped while still armed (the create future was
/// cancelled between pause and resume) it schedules a resume on the
/// current runtime and raises the instance's resume flag once the
/// hypervisor accepts it.
struct PauseGuard {
    client: ControlClient,
    resumed: Arc<AtomicBool>,
    armed: bool,
}

impl PauseGuard {
    fn arm(client: ControlClient, resumed: Arc<AtomicBool>) -> Self {
        Self {
            client,
            resumed,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let resumed = self.resumed.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(socket = %client.address(), "snapshot abandoned while paused, resuming VM");
                handle.spawn(async move {
                    match client.resume().await {
                        Ok(()) => resumed.store(true, Ordering::Release),
                        Err(e) => {
                            tracing::error!(socket = %client.address(), error = %e, "failed to resume VM");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::error!(socket = %client.address(), "snapshot abandoned while paused and no runtime to resume VM");
            }
        }
    }
}

// =============================================================================
// SnapshotCoordinator
// =============================================================================

/// Drives the create and load protocols on one [`VmInstance`].
pub struct SnapshotCoordinator<'a> {
    instance: &'a mut VmInstance,
}

impl<'a> SnapshotCoordinator<'a> {
    pub fn new(instance: &'a mut VmInstance) -> Self {
        Self { instance }
    }

    /// Capture `artifact` from a running or paused VM.
    ///
    /// A running VM is paused for the capture and resumed afterwards, also
    /// when the capture fails, so the VM ends in the state it started in.
    /// Partially written images are left in place.
    pub async fn create(
        &mut self,
        artifact: &SnapshotArtifact,
        options: SnapshotOptions,
    ) -> Result<SnapshotReport> {
        let owns_pause = match self.instance.state() {
            VmState::Running => true,
            VmState::Paused => false,
            current => {
                return Err(Error::IllegalStateTransition {
                    current,
                    attempted: Transition::CreateSnapshot,
                });
            }
        };

        let guard = if owns_pause {
            self.instance
                .pause()
                .await
                .map_err(|e| e.at_step(SnapshotStep::Pause))?;
            let resumed = self.instance.resume_flag();
            self.instance
                .client()
                .cloned()
                .map(|client| PauseGuard::arm(client, resumed))
        } else {
            None
        };

        let started = Instant::now();
        let captured = self
            .instance
            .create_snapshot(artifact, options.snapshot_type)
            .await
            .map_err(|e| e.at_step(SnapshotStep::Capture));
        let elapsed = started.elapsed();

        if owns_pause {
            let resumed = self
                .instance
                .resume()
                .await
                .map_err(|e| e.at_step(SnapshotStep::Resume));
            if let Some(guard) = guard {
                guard.disarm();
            }
            match (&captured, resumed) {
                (_, Ok(())) => {}
                (Ok(()), Err(e)) => return Err(e),
                (Err(_), Err(e)) => {
                    tracing::error!(error = %e, "failed to resume VM after failed snapshot");
                }
            }
        }
        captured?;

        tracing::info!(
            base = %artifact.base().display(),
            snapshot_type = %options.snapshot_type,
            elapsed_ms = elapsed.as_millis() as u64,
            "created snapshot"
        );
        Ok(SnapshotReport {
            artifact: artifact.clone(),
            snapshot_type: Some(options.snapshot_type),
            elapsed,
        })
    }

    /// Restore `artifact` into this instance and resume it.
    ///
    /// The instance must have been built from a restore configuration
    /// ([`VmConfig::for_restore`](crate::VmConfig::for_restore)). If no
    /// hypervisor is running yet, one is spawned first.
    pub async fn load(&mut self, artifact: &SnapshotArtifact) -> Result<SnapshotReport> {
        artifact
            .verify()
            .map_err(|e| e.at_step(SnapshotStep::Verify))?;

        if self.instance.client().is_none() {
            self.instance.spawn().await.map_err(|e| {
                let step = match e {
                    Error::SpawnFailed { .. } => SnapshotStep::Spawn,
                    _ => SnapshotStep::Connect,
                };
                e.at_step(step)
            })?;
        }

        self.instance
            .configure()
            .await
            .map_err(|e| e.at_step(SnapshotStep::Configure))?;

        let started = Instant::now();
        self.instance
            .load_snapshot(artifact)
            .await
            .map_err(|e| e.at_step(SnapshotStep::Load))?;
        let elapsed = started.elapsed();
        tracing::info!(
            base = %artifact.base().display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "loaded snapshot"
        );

        self.instance
            .resume()
            .await
            .map_err(|e| e.at_step(SnapshotStep::Resume))?;

        Ok(SnapshotReport {
            artifact: artifact.clone(),
            snapshot_type: None,
            elapsed,
        })
    }
}
