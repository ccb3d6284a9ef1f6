//! Launch, snapshot and restore Firecracker microVMs.
//!
//! ```no_run
//! use fc_snap::sdk::{Orchestrator, VmConfig};
//!
//! # async fn example() -> fc_snap::sdk::Result<()> {
//! let status = Orchestrator::new(VmConfig::new("/tmp/firecracker.sock"))
//!     .launch_fresh()
//!     .await?;
//! println!("exit_status={status}");
//! # Ok(())
//! # }
//! ```

/// Process supervision, control client, lifecycle and snapshot protocols.
///
/// - [`sdk::Orchestrator`]: launch, snapshot and restore end to end
/// - [`sdk::VmInstance`]: one live microVM
/// - [`sdk::SnapshotCoordinator`]: pause/capture/resume and load/resume
pub use snap_sdk as sdk;
