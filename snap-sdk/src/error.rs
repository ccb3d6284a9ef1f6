use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use crate::snapshot::SnapshotStep;
use crate::state::{Transition, VmState};

/// Errors returned by the snapshot SDK.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The hypervisor binary could not be executed.
    #[error("failed to spawn {}: {source}", binary.display())]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The control channel never became ready.
    #[error("timed out after {timeout:?} waiting for control channel at {}", address.display())]
    ConnectTimeout { address: PathBuf, timeout: Duration },

    /// A lifecycle operation was attempted from a state that does not permit it.
    #[error("cannot {attempted} while VM is {current}")]
    IllegalStateTransition {
        current: VmState,
        attempted: Transition,
    },

    /// The hypervisor rejected or failed a control request.
    #[error("{operation} rejected by hypervisor: {detail}")]
    ControlChannel {
        operation: &'static str,
        detail: String,
    },

    /// The control request never produced a usable response.
    #[error("{operation} failed on the control channel: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The hypervisor process exited when it was expected to keep running.
    #[error("hypervisor exited unexpectedly: {0}")]
    ProcessExitUnexpected(ExitStatus),

    /// A control operation was issued before the channel was connected.
    #[error("{operation} requires a connected control channel")]
    NotConnected { operation: &'static str },

    /// Missing required configuration.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// Configuration present but unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Snapshot files that cannot be loaded.
    #[error("invalid snapshot artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },

    /// A step of the snapshot create/load protocol failed.
    #[error("snapshot {step} step failed: {source}")]
    Snapshot {
        step: SnapshotStep,
        #[source]
        source: Box<Error>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap this error with the snapshot protocol step that produced it.
    pub fn at_step(self, step: SnapshotStep) -> Self {
        Self::Snapshot {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through snapshot step tags.
    pub fn root(&self) -> &Error {
        match self {
            Self::Snapshot { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_nested_steps() {
        let err = Error::MissingConfig("kernel_image_path")
            .at_step(SnapshotStep::Configure)
            .at_step(SnapshotStep::Load);
        assert!(matches!(err.root(), Error::MissingConfig("kernel_image_path")));
    }

    #[test]
    fn test_display_names_state_and_operation() {
        let err = Error::IllegalStateTransition {
            current: VmState::Unconfigured,
            attempted: Transition::Pause,
        };
        assert_eq!(err.to_string(), "cannot pause while VM is unconfigured");

        let err = Error::ControlChannel {
            operation: "create_snapshot",
            detail: "VM is not paused".into(),
        };
        assert_eq!(
            err.to_string(),
            "create_snapshot rejected by hypervisor: VM is not paused"
        );
    }
}
