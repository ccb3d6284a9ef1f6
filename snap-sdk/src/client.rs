//! Typed request/response client for the hypervisor's control channel.
//!
//! The client holds no lifecycle state of its own: every method is one HTTP
//! request over the Unix socket, and a non-2xx answer becomes
//! [`Error::ControlChannel`].

use std::path::Path;
use std::time::Duration;

use reqwest::{Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout as tokio_timeout};

use crate::address::ChannelAddress;
use crate::config::{ChannelOptions, VmConfig};
use crate::error::{Error, Result};
use crate::models::{
    ActionType, ApiError, BootSource, Drive, InstanceActionInfo, InstanceInfo,
    MachineConfiguration, MemoryBackend, MemoryBackendType, RunState, SnapshotCreateParams,
    SnapshotLoadParams, VmStateUpdate,
};
use crate::snapshot::{SnapshotArtifact, SnapshotType};

// =============================================================================
// Readiness Polling
// =============================================================================

/// Poll until something accepts connections at `path`.
///
/// The interval starts at `poll_interval` and doubles up to `max_interval`.
async fn wait_for_socket(
    path: &Path,
    timeout_duration: Duration,
    poll_interval: Duration,
    max_interval: Duration,
) -> Result<()> {
    let path = path.to_owned();
    let mut interval = poll_interval;
    tokio_timeout(timeout_duration, async {
        loop {
            if path.exists() && UnixStream::connect(&path).await.is_ok() {
                return;
            }
            sleep(interval).await;
            interval = (interval * 2).min(max_interval);
        }
    })
    .await
    .map_err(|_| Error::ConnectTimeout {
        address: path,
        timeout: timeout_duration,
    })
}

// =============================================================================
// ControlClient
// =============================================================================

/// Client for one hypervisor's API socket.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    address: ChannelAddress,
}

impl ControlClient {
    /// Create a client for `address` without checking that it is reachable.
    pub fn new(address: &ChannelAddress, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .unix_socket(address.path())
            .timeout(request_timeout)
            .build()
            .map_err(|source| Error::Transport {
                operation: "connect",
                source,
            })?;
        Ok(Self {
            http,
            address: address.clone(),
        })
    }

    /// Wait for the hypervisor to accept connections at `address`, then
    /// return a client for it.
    ///
    /// Fails with [`Error::ConnectTimeout`] once `init_timeout` elapses.
    pub async fn connect(address: &ChannelAddress, options: &ChannelOptions) -> Result<Self> {
        tracing::debug!(socket = %address, timeout = ?options.init_timeout(), "waiting for control channel");
        wait_for_socket(
            address.path(),
            options.init_timeout(),
            options.poll_interval(),
            options.max_poll_interval(),
        )
        .await?;
        tracing::debug!(socket = %address, "control channel ready");
        Self::new(address, options.request_timeout())
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    // =========================================================================
    // Transport
    // =========================================================================

    async fn send<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        tracing::debug!(operation, %method, path, "control request");

        // The host is ignored for Unix sockets; we use "http://localhost".
        let mut request = self
            .http
            .request(method, format!("http://localhost{path}"))
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|source| Error::Transport { operation, source })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail = match serde_json::from_str::<ApiError>(&body) {
            Ok(err) => err.fault_message,
            Err(_) if body.trim().is_empty() => status.to_string(),
            Err(_) => format!("{status}: {}", body.trim()),
        };
        tracing::debug!(operation, %status, %detail, "control request rejected");
        Err(Error::ControlChannel { operation, detail })
    }

    async fn put<B: Serialize + ?Sized>(
        &self,
        operation: &'static str,
        path: &str,
        body: &B,
    ) -> Result<()> {
        self.send(operation, Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, operation: &'static str, path: &str) -> Result<T> {
        let response = self
            .send::<()>(operation, Method::GET, path, None)
            .await?;
        let body = response
            .text()
            .await
            .map_err(|source| Error::Transport { operation, source })?;
        serde_json::from_str(&body).map_err(|e| Error::ControlChannel {
            operation,
            detail: format!("malformed response: {e}"),
        })
    }

    async fn action(&self, operation: &'static str, action_type: ActionType) -> Result<()> {
        self.put(operation, "/actions", &InstanceActionInfo { action_type })
            .await
    }

    async fn set_run_state(&self, operation: &'static str, state: RunState) -> Result<()> {
        self.send(operation, Method::PATCH, "/vm", Some(&VmStateUpdate { state }))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Get general information about the instance.
    pub async fn describe(&self) -> Result<InstanceInfo> {
        self.get("describe", "/").await
    }

    /// Send the boot source, machine configuration and drives.
    ///
    /// A restore template sends nothing: the snapshot supplies that state.
    pub async fn configure(&self, config: &VmConfig) -> Result<()> {
        if config.is_restore_template() {
            tracing::debug!(socket = %self.address, "configuration deferred to snapshot load");
            return Ok(());
        }

        let kernel = config
            .kernel_image_path
            .as_ref()
            .ok_or(Error::MissingConfig("kernel_image_path"))?;
        for drive in &config.drives {
            drive.check_id()?;
        }

        self.put(
            "configure",
            "/boot-source",
            &BootSource {
                kernel_image_path: kernel.display().to_string(),
                boot_args: Some(config.boot_args.clone()).filter(|args| !args.is_empty()),
            },
        )
        .await?;

        self.put(
            "configure",
            "/machine-config",
            &MachineConfiguration::from_config(config),
        )
        .await?;

        for drive in &config.drives {
            self.put(
                "configure",
                &format!("/drives/{}", drive.drive_id),
                &Drive::from(drive),
            )
            .await?;
        }

        Ok(())
    }

    /// Boot the configured microVM.
    pub async fn start(&self) -> Result<()> {
        self.action("start", ActionType::InstanceStart).await
    }

    /// Pause the microVM.
    pub async fn pause(&self) -> Result<()> {
        self.set_run_state("pause", RunState::Paused).await
    }

    /// Resume a paused microVM.
    pub async fn resume(&self) -> Result<()> {
        self.set_run_state("resume", RunState::Resumed).await
    }

    /// Write the memory and device state of a paused microVM to `artifact`.
    pub async fn create_snapshot(
        &self,
        artifact: &SnapshotArtifact,
        snapshot_type: SnapshotType,
    ) -> Result<()> {
        self.put(
            "create_snapshot",
            "/snapshot/create",
            &SnapshotCreateParams {
                snapshot_type,
                snapshot_path: artifact.state_path().display().to_string(),
                mem_file_path: artifact.mem_path().display().to_string(),
            },
        )
        .await
    }

    /// Replace the state of a fresh microVM with `artifact`.
    pub async fn load_snapshot(
        &self,
        artifact: &SnapshotArtifact,
        track_dirty_pages: bool,
        resume_after_load: bool,
    ) -> Result<()> {
        self.put(
            "load_snapshot",
            "/snapshot/load",
            &SnapshotLoadParams {
                snapshot_path: artifact.state_path().display().to_string(),
                mem_backend: MemoryBackend {
                    backend_type: MemoryBackendType::File,
                    backend_path: artifact.mem_path().display().to_string(),
                },
                track_dirty_pages,
                resume_vm: resume_after_load,
            },
        )
        .await
    }

    /// Ask the guest to shut down (Ctrl+Alt+Del).
    pub async fn shutdown(&self) -> Result<()> {
        self.action("shutdown", ActionType::SendCtrlAltDel).await
    }
}
