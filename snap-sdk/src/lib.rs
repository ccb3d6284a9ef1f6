//! Launch, snapshot and restore Firecracker microVMs.
//!
//! The crate supervises the `firecracker` process, drives it over its Unix
//! socket API, and tracks each VM's lifecycle so that only legal operations
//! reach the hypervisor. [`Orchestrator`] bundles the three end-to-end flows;
//! the lower-level pieces are public for callers that need finer control.
//!
//! # Quick Start
//!
//! ```no_run
//! use snap_sdk::{Orchestrator, SnapshotOptions, SnapshotType, VmConfig};
//!
//! # async fn example() -> snap_sdk::Result<()> {
//! // Boot with the stock defaults and block until the guest exits.
//! let status = Orchestrator::new(VmConfig::new("/tmp/firecracker.sock"))
//!     .launch_fresh()
//!     .await?;
//! println!("exit_status={status}");
//!
//! // From another process: snapshot the running VM.
//! let report = Orchestrator::new(VmConfig::new("/tmp/firecracker.sock"))
//!     .create_snapshot_for("/snapshots/vm1", SnapshotOptions::new(SnapshotType::Full))
//!     .await?;
//! println!("snapshot took {:?}", report.elapsed);
//!
//! // Later: restore it into a fresh process.
//! let outcome = Orchestrator::new(VmConfig::new("/tmp/restored.sock"))
//!     .restore_from_snapshot("/snapshots/vm1")
//!     .await?;
//! println!("exit_status={}", outcome.exit_status);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod instance;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod snapshot;
pub mod state;

pub use address::{AddressLease, ChannelAddress};
pub use client::ControlClient;
pub use config::{ChannelOptions, DriveConfig, ProcessOptions, VmConfig};
pub use error::{Error, Result};
pub use instance::VmInstance;
pub use orchestrator::{Orchestrator, RestoreOutcome};
pub use process::{HypervisorProcess, ProcessBuilder, StdioMode};
pub use snapshot::{
    SnapshotArtifact, SnapshotCoordinator, SnapshotOptions, SnapshotReport, SnapshotStep,
    SnapshotType,
};
pub use state::{Lifecycle, Transition, VmState};
