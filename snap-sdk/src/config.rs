//! Immutable launch descriptor for one microVM.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::ChannelAddress;
use crate::error::{Error, Result};
use crate::process::StdioMode;

/// Largest vCPU count the hypervisor accepts.
pub const MAX_VCPUS: u64 = 32;
pub const MAX_DRIVE_ID_LEN: usize = 64;

pub const DEFAULT_FIRECRACKER_BIN: &str = "./firecracker";
pub const DEFAULT_KERNEL: &str = "vmlinux.bin";
pub const DEFAULT_ROOTFS: &str = "rootfs.ext4";
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off quiet";

/// A block device attached before boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    #[serde(default)]
    pub is_root_device: bool,
    #[serde(default)]
    pub is_read_only: bool,
}

impl DriveConfig {
    /// A writable root drive named `rootfs`.
    pub fn root(path_on_host: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: "rootfs".to_owned(),
            path_on_host: path_on_host.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }

    /// Reject ids the hypervisor would not accept as a `/drives/{id}` path
    /// segment: empty, longer than [`MAX_DRIVE_ID_LEN`], or anything other
    /// than ASCII alphanumerics and `_`.
    pub fn check_id(&self) -> Result<()> {
        let id = &self.drive_id;
        if id.is_empty() || id.len() > MAX_DRIVE_ID_LEN {
            return Err(Error::InvalidConfig(format!(
                "drive id must be 1 to {MAX_DRIVE_ID_LEN} characters, got {id:?}"
            )));
        }
        if let Some(c) = id.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
            return Err(Error::InvalidConfig(format!(
                "drive id {id:?} contains invalid character {c:?}"
            )));
        }
        Ok(())
    }
}

/// How the hypervisor process is started and supervised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Instance identifier passed as `--id`.
    pub id: Option<String>,
    /// Hypervisor log file passed as `--log-path`.
    pub log_path: Option<PathBuf>,
    /// Hypervisor log level passed as `--level`.
    pub log_level: Option<String>,
    pub no_seccomp: bool,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
    /// Grace period between SIGTERM and SIGKILL on terminate.
    pub terminate_grace_ms: u64,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            id: None,
            log_path: None,
            log_level: None,
            no_seccomp: false,
            stdin: StdioMode::Inherit,
            stdout: StdioMode::Inherit,
            stderr: StdioMode::Inherit,
            terminate_grace_ms: 2_000,
        }
    }
}

impl ProcessOptions {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Timing of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// How long to wait for the socket after spawning the hypervisor.
    pub init_timeout_ms: u64,
    /// First readiness poll interval; doubles up to `max_poll_interval_ms`.
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// Per-request deadline.
    pub request_timeout_ms: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            init_timeout_ms: 3_000,
            poll_interval_ms: 10,
            max_poll_interval_ms: 250,
            request_timeout_ms: 10_000,
        }
    }
}

impl ChannelOptions {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Everything needed to launch, snapshot or restore one microVM.
///
/// Built once before launch and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub socket_path: ChannelAddress,
    #[serde(default = "default_firecracker_bin")]
    pub firecracker_bin: PathBuf,
    /// Absent for the restore template: the snapshot carries the guest.
    #[serde(default)]
    pub kernel_image_path: Option<PathBuf>,
    #[serde(default = "default_boot_args")]
    pub boot_args: String,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u64,
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: u64,
    #[serde(default)]
    pub smt: bool,
    /// Required for `Diff` snapshots.
    #[serde(default = "default_true")]
    pub track_dirty_pages: bool,
    #[serde(default)]
    pub drives: Vec<DriveConfig>,
    #[serde(default)]
    pub disable_validation: bool,
    #[serde(default)]
    pub process: ProcessOptions,
    #[serde(default)]
    pub channel: ChannelOptions,
}

fn default_firecracker_bin() -> PathBuf {
    PathBuf::from(DEFAULT_FIRECRACKER_BIN)
}

fn default_boot_args() -> String {
    DEFAULT_BOOT_ARGS.to_owned()
}

fn default_vcpu_count() -> u64 {
    2
}

fn default_mem_size_mib() -> u64 {
    4096
}

fn default_true() -> bool {
    true
}

impl VmConfig {
    /// Configuration with the stock launcher defaults: `./firecracker`,
    /// `vmlinux.bin`, a `rootfs.ext4` root drive, 2 vCPUs and 4096 MiB.
    pub fn new(socket_path: impl Into<ChannelAddress>) -> Self {
        Self {
            socket_path: socket_path.into(),
            firecracker_bin: default_firecracker_bin(),
            kernel_image_path: Some(PathBuf::from(DEFAULT_KERNEL)),
            boot_args: default_boot_args(),
            vcpu_count: default_vcpu_count(),
            mem_size_mib: default_mem_size_mib(),
            smt: false,
            track_dirty_pages: true,
            drives: vec![DriveConfig::root(DEFAULT_ROOTFS)],
            disable_validation: false,
            process: ProcessOptions::default(),
            channel: ChannelOptions::default(),
        }
    }

    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }

    /// Derive the configuration used to restore a snapshot into a fresh
    /// process: no kernel, no drives, validation disabled.
    pub fn for_restore(&self) -> Self {
        Self {
            kernel_image_path: None,
            drives: Vec::new(),
            disable_validation: true,
            ..self.clone()
        }
    }

    /// Whether configuring this VM is deferred to a snapshot load.
    pub fn is_restore_template(&self) -> bool {
        self.disable_validation && self.kernel_image_path.is_none()
    }

    /// Check the configuration before launch. No-op when validation is disabled.
    pub fn validate(&self) -> Result<()> {
        if self.disable_validation {
            return Ok(());
        }

        let kernel = self
            .kernel_image_path
            .as_ref()
            .ok_or(Error::MissingConfig("kernel_image_path"))?;
        if !kernel.exists() {
            return Err(Error::InvalidConfig(format!(
                "kernel image {} does not exist",
                kernel.display()
            )));
        }

        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            return Err(Error::InvalidConfig(format!(
                "vcpu_count must be between 1 and {MAX_VCPUS}, got {}",
                self.vcpu_count
            )));
        }
        if self.mem_size_mib == 0 {
            return Err(Error::InvalidConfig(
                "mem_size_mib must be greater than 0".to_owned(),
            ));
        }

        let mut ids = HashSet::new();
        let mut roots = 0;
        for drive in &self.drives {
            drive.check_id()?;
            if !ids.insert(drive.drive_id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate drive id {}",
                    drive.drive_id
                )));
            }
            if !drive.path_on_host.exists() {
                return Err(Error::InvalidConfig(format!(
                    "drive {} image {} does not exist",
                    drive.drive_id,
                    drive.path_on_host.display()
                )));
            }
            if drive.is_root_device {
                roots += 1;
            }
        }
        if roots > 1 {
            return Err(Error::InvalidConfig(
                "at most one drive may be the root device".to_owned(),
            ));
        }

        Ok(())
    }
}
