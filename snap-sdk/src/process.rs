//! Supervision of the hypervisor process.
//!
//! [`ProcessBuilder`] assembles the command line and stream wiring,
//! [`HypervisorProcess`] owns the child until it has been reaped.
//!
//! ```no_run
//! use snap_sdk::process::ProcessBuilder;
//!
//! # async fn example() -> snap_sdk::Result<()> {
//! let mut process = ProcessBuilder::new("./firecracker", "/tmp/firecracker.sock")
//!     .id("my-vm")
//!     .spawn()?;
//!
//! // ... drive the VM over its socket ...
//!
//! let status = process.terminate().await?;
//! println!("exited with {status}");
//! # Ok(())
//! # }
//! ```

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::time::timeout as tokio_timeout;

use crate::address::ChannelAddress;
use crate::config::VmConfig;
use crate::error::{Error, Result};

/// Where one of the hypervisor's standard streams goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdioMode {
    /// Share the caller's stream (the guest serial console shows up here).
    #[default]
    Inherit,
    Null,
    /// Append to a file, creating it if needed.
    File(PathBuf),
}

impl StdioMode {
    fn to_stdio(&self) -> std::io::Result<Stdio> {
        match self {
            Self::Inherit => Ok(Stdio::inherit()),
            Self::Null => Ok(Stdio::null()),
            Self::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
        }
    }
}

// =============================================================================
// ProcessBuilder
// =============================================================================

/// Builder for spawning the hypervisor.
#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    firecracker_bin: PathBuf,
    socket_path: ChannelAddress,
    id: Option<String>,
    log_path: Option<PathBuf>,
    log_level: Option<String>,
    no_seccomp: bool,
    stdin: StdioMode,
    stdout: StdioMode,
    stderr: StdioMode,
    terminate_grace: Duration,
}

impl ProcessBuilder {
    /// Create a new builder for spawning the hypervisor.
    pub fn new(firecracker_bin: impl Into<PathBuf>, socket_path: impl Into<ChannelAddress>) -> Self {
        Self {
            firecracker_bin: firecracker_bin.into(),
            socket_path: socket_path.into(),
            id: None,
            log_path: None,
            log_level: None,
            no_seccomp: false,
            stdin: StdioMode::Inherit,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
            terminate_grace: Duration::from_secs(2),
        }
    }

    /// Builder carrying the binary, socket and process options of `config`.
    pub fn from_config(config: &VmConfig) -> Self {
        let opts = &config.process;
        Self {
            firecracker_bin: config.firecracker_bin.clone(),
            socket_path: config.socket_path.clone(),
            id: opts.id.clone(),
            log_path: opts.log_path.clone(),
            log_level: opts.log_level.clone(),
            no_seccomp: opts.no_seccomp,
            stdin: opts.stdin.clone(),
            stdout: opts.stdout.clone(),
            stderr: opts.stderr.clone(),
            terminate_grace: opts.terminate_grace(),
        }
    }

    /// Set the VM identifier.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the log output path.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Disable seccomp filtering.
    pub fn no_seccomp(mut self, no_seccomp: bool) -> Self {
        self.no_seccomp = no_seccomp;
        self
    }

    pub fn stdin(mut self, mode: StdioMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stdout(mut self, mode: StdioMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: StdioMode) -> Self {
        self.stderr = mode;
        self
    }

    /// How long [`HypervisorProcess::terminate`] waits after SIGTERM.
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Build the command-line arguments for the hypervisor process.
    fn build_args(&self) -> Vec<String> {
        let mut args = vec!["--api-sock".to_owned(), self.socket_path.to_string()];

        if let Some(id) = &self.id {
            args.push("--id".to_owned());
            args.push(id.clone());
        }

        if let Some(path) = &self.log_path {
            args.push("--log-path".to_owned());
            args.push(path.display().to_string());
        }

        if let Some(level) = &self.log_level {
            args.push("--level".to_owned());
            args.push(level.clone());
        }

        if self.no_seccomp {
            args.push("--no-seccomp".to_owned());
        }

        args
    }

    /// Spawn the hypervisor.
    ///
    /// Does not wait for the API socket; see
    /// [`ControlClient::connect`](crate::client::ControlClient::connect).
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<HypervisorProcess> {
        let spawn_failed = |source| Error::SpawnFailed {
            binary: self.firecracker_bin.clone(),
            source,
        };

        let child = Command::new(&self.firecracker_bin)
            .args(self.build_args())
            .stdin(self.stdin.to_stdio().map_err(spawn_failed)?)
            .stdout(self.stdout.to_stdio().map_err(spawn_failed)?)
            .stderr(self.stderr.to_stdio().map_err(spawn_failed)?)
            .spawn()
            .map_err(spawn_failed)?;

        let pid = child.id();
        tracing::info!(
            binary = %self.firecracker_bin.display(),
            socket = %self.socket_path,
            pid = ?pid,
            "spawned hypervisor"
        );

        Ok(HypervisorProcess {
            child: Some(child),
            pid,
            status: None,
            terminate_grace: self.terminate_grace,
        })
    }
}

// =============================================================================
// HypervisorProcess
// =============================================================================

/// Handle to a running hypervisor process.
///
/// The process is reaped exactly once; afterwards every method returns the
/// recorded exit status. Dropping a handle whose process is still alive sends
/// SIGKILL.
#[derive(Debug)]
pub struct HypervisorProcess {
    child: Option<Child>,
    pid: Option<u32>,
    status: Option<ExitStatus>,
    terminate_grace: Duration,
}

impl HypervisorProcess {
    /// PID while the process has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the process has already been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Check for exit without blocking.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(child) = &mut self.child
            && let Some(status) = child.try_wait()?
        {
            self.reaped(status);
        }
        Ok(self.status)
    }

    /// Wait for the hypervisor process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(child) = &mut self.child {
            let status = child.wait().await?;
            self.reaped(status);
        }
        self.recorded()
    }

    /// Stop the process: SIGTERM, then SIGKILL once the grace period lapses.
    ///
    /// Safe to call on a process that already exited, any number of times.
    pub async fn terminate(&mut self) -> Result<ExitStatus> {
        if self.try_status()?.is_none()
            && let (Some(child), Some(pid)) = (&mut self.child, self.pid)
        {
            tracing::debug!(pid, "sending SIGTERM to hypervisor");
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            let status = match tokio_timeout(self.terminate_grace, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(pid, grace = ?self.terminate_grace, "hypervisor ignored SIGTERM, killing");
                    child.kill().await?;
                    child.wait().await?
                }
            };
            self.reaped(status);
        }
        self.recorded()
    }

    /// Forcefully kill the process (SIGKILL).
    pub async fn kill(&mut self) -> Result<ExitStatus> {
        if self.try_status()?.is_none()
            && let Some(child) = &mut self.child
        {
            child.kill().await?;
            let status = child.wait().await?;
            self.reaped(status);
        }
        self.recorded()
    }

    fn reaped(&mut self, status: ExitStatus) {
        tracing::debug!(pid = ?self.pid, %status, "hypervisor exited");
        self.child = None;
        self.pid = None;
        self.status = Some(status);
    }

    fn recorded(&self) -> Result<ExitStatus> {
        self.status.ok_or_else(|| {
            Error::Other("hypervisor process has no recorded exit status".to_owned())
        })
    }
}

impl Drop for HypervisorProcess {
    fn drop(&mut self) {
        // Best-effort SIGKILL if the process is still running.
        if let Some(pid) = self.pid {
            tracing::debug!(pid, "killing hypervisor on drop");
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use std::path::Path;

    use super::*;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Running and not a zombie waiting to be reaped.
    fn is_alive(pid: u32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat.rsplit(')').next().and_then(|rest| rest.trim().chars().next());
        !matches!(state, Some('Z') | Some('X') | None)
    }

    #[test]
    fn test_builder_args() {
        let builder = ProcessBuilder::new("/usr/bin/firecracker", "/tmp/fc.sock")
            .id("test-vm")
            .log_path("/var/log/fc.log")
            .log_level("Debug")
            .no_seccomp(true);

        let args = builder.build_args();
        assert_eq!(args[0], "--api-sock");
        assert_eq!(args[1], "/tmp/fc.sock");
        assert!(args.contains(&"--id".to_owned()));
        assert!(args.contains(&"test-vm".to_owned()));
        assert!(args.contains(&"--log-path".to_owned()));
        assert!(args.contains(&"/var/log/fc.log".to_owned()));
        assert!(args.contains(&"--level".to_owned()));
        assert!(args.contains(&"Debug".to_owned()));
        assert!(args.contains(&"--no-seccomp".to_owned()));
    }

    #[test]
    fn test_builder_minimal_args() {
        let args = ProcessBuilder::new("firecracker", "/run/fc.sock").build_args();
        assert_eq!(args, vec!["--api-sock", "/run/fc.sock"]);
    }

    #[test]
    fn test_from_config_carries_process_options() {
        let mut config = VmConfig::new("/run/vm.sock");
        config.firecracker_bin = "/opt/fc/firecracker".into();
        config.process.id = Some("vm-7".into());
        config.process.terminate_grace_ms = 500;

        let builder = ProcessBuilder::from_config(&config);
        assert_eq!(builder.firecracker_bin, PathBuf::from("/opt/fc/firecracker"));
        assert_eq!(builder.terminate_grace, Duration::from_millis(500));
        assert_eq!(
            builder.build_args(),
            vec!["--api-sock", "/run/vm.sock", "--id", "vm-7"]
        );
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let err = ProcessBuilder::new("/nonexistent/firecracker", "/tmp/fc.sock")
            .spawn()
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
        assert!(err.to_string().contains("/nonexistent/firecracker"));
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "exit 3");

        let mut process = ProcessBuilder::new(&bin, dir.path().join("fc.sock"))
            .spawn()
            .unwrap();
        let status = process.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(process.pid(), None);
        // A second wait returns the recorded status.
        assert_eq!(process.wait().await.unwrap().code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "exec sleep 30");

        let mut process = ProcessBuilder::new(&bin, dir.path().join("fc.sock"))
            .stdout(StdioMode::Null)
            .spawn()
            .unwrap();
        let pid = process.pid().unwrap();
        assert!(process.try_status().unwrap().is_none());

        let first = process.terminate().await.unwrap();
        assert_eq!(first.signal(), Some(libc::SIGTERM));
        assert!(!is_alive(pid));

        let second = process.terminate().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(process.kill().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "trap '' TERM\nwhile :; do sleep 1; done");

        let mut process = ProcessBuilder::new(&bin, dir.path().join("fc.sock"))
            .terminate_grace(Duration::from_millis(200))
            .spawn()
            .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = process.terminate().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "exit 0");

        let mut process = ProcessBuilder::new(&bin, dir.path().join("fc.sock"))
            .spawn()
            .unwrap();
        process.wait().await.unwrap();
        assert!(process.terminate().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_stdout_redirected_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "echo \"started $1 $2\"");
        let log = dir.path().join("console.log");

        let mut process = ProcessBuilder::new(&bin, "/tmp/console.sock")
            .stdout(StdioMode::File(log.clone()))
            .spawn()
            .unwrap();
        process.wait().await.unwrap();

        let out = std::fs::read_to_string(&log).unwrap();
        assert_eq!(out.trim(), "started --api-sock /tmp/console.sock");
    }

    #[tokio::test]
    async fn test_drop_kills_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "fc", "exec sleep 30");

        let process = ProcessBuilder::new(&bin, dir.path().join("fc.sock"))
            .spawn()
            .unwrap();
        let pid = process.pid().unwrap();
        drop(process);

        for _ in 0..50 {
            if !is_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {pid} survived drop");
    }
}
