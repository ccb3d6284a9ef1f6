//! Lifecycle state machine for a single microVM instance.
//!
//! ```text
//! Unconfigured --configure--> Configured --start--> Running <--pause/resume--> Paused
//!                              Configured --load_snapshot (validation off)--> Paused
//! any --stop--> Stopped          live --crash--> Crashed
//! ```
//!
//! The machine only records what the control channel has confirmed. Callers
//! check a transition before issuing the request and apply it once the
//! hypervisor accepted it, so a failed request leaves the state untouched.

use std::fmt;

use crate::error::{Error, Result};

/// Lifecycle state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    Unconfigured,
    Configured,
    Running,
    Paused,
    Stopped,
    Crashed,
}

impl VmState {
    /// Whether a hypervisor process may still be serving this instance.
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Map the `state` field reported by the hypervisor's instance info.
    pub fn from_reported(reported: &str) -> Option<Self> {
        match reported {
            "Not started" => Some(Self::Configured),
            "Running" => Some(Self::Running),
            "Paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// An operation that moves (or is checked against) the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Apply the pre-boot configuration.
    Configure { validation_disabled: bool },
    Start,
    Pause,
    Resume,
    /// Capture a snapshot. Check-only: the state does not change.
    CreateSnapshot,
    LoadSnapshot,
    Stop,
    Crash,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configure { .. } => "configure",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::CreateSnapshot => "create snapshot",
            Self::LoadSnapshot => "load snapshot",
            Self::Stop => "stop",
            Self::Crash => "crash",
        };
        f.write_str(name)
    }
}

/// Authoritative lifecycle of one VM instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: VmState,
    /// Set when configured with validation disabled; gates `LoadSnapshot`.
    restorable: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: VmState::Unconfigured,
            restorable: false,
        }
    }

    /// Seed a lifecycle from a state observed on an already-running hypervisor.
    pub fn observed(state: VmState) -> Self {
        Self {
            state,
            restorable: false,
        }
    }

    pub fn current(&self) -> VmState {
        self.state
    }

    /// Compute the state `transition` would lead to, without applying it.
    pub fn check(&self, transition: Transition) -> Result<VmState> {
        use VmState::*;

        let next = match (self.state, transition) {
            (Unconfigured, Transition::Configure { .. }) => Some(Configured),
            (Configured, Transition::Start) => Some(Running),
            (Running, Transition::Pause) => Some(Paused),
            (Paused, Transition::Resume) => Some(Running),
            (Paused, Transition::CreateSnapshot) => Some(Paused),
            (Configured, Transition::LoadSnapshot) if self.restorable => Some(Paused),
            (_, Transition::Stop) => Some(Stopped),
            (current, Transition::Crash) if current.is_live() => Some(Crashed),
            _ => None,
        };

        next.ok_or(Error::IllegalStateTransition {
            current: self.state,
            attempted: transition,
        })
    }

    /// Apply `transition`, returning the new state.
    ///
    /// On error the state is left unchanged.
    pub fn apply(&mut self, transition: Transition) -> Result<VmState> {
        let next = self.check(transition)?;
        if let Transition::Configure {
            validation_disabled,
        } = transition
        {
            self.restorable = validation_disabled;
        }
        self.state = next;
        Ok(next)
    }

    /// Record that the hypervisor process exited.
    ///
    /// A clean exit stops the instance; any other exit of a live instance
    /// marks it crashed.
    pub fn observe_exit(&mut self, success: bool) -> VmState {
        self.state = if !success && self.state.is_live() {
            VmState::Crashed
        } else {
            VmState::Stopped
        };
        self.state
    }
}
