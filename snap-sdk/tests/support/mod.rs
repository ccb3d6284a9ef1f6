//! In-process stand-in for the Firecracker API socket.
//!
//! Speaks just enough HTTP/1.1 for the control client: one request at a time
//! per connection, `Content-Length` bodies, JSON responses.

#![allow(dead_code)]

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

pub const STOCK_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off quiet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Value,
}

#[derive(Debug)]
pub struct MockState {
    /// As reported by `GET /`: `Not started`, `Running` or `Paused`.
    pub vm_state: String,
    /// Stand-in for guest memory, written to and read from the `.mem` file.
    pub memory: Vec<u8>,
    /// `"METHOD /path"` entries that answer 400.
    pub failing: HashSet<String>,
    /// `"METHOD /path"` entries that never get an answer.
    pub stalled: HashSet<String>,
    pub requests: Vec<Recorded>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            vm_state: "Not started".to_owned(),
            memory: Vec::new(),
            failing: HashSet::new(),
            stalled: HashSet::new(),
            requests: Vec::new(),
        }
    }
}

pub struct MockHypervisor {
    path: PathBuf,
    state: Arc<Mutex<MockState>>,
    task: JoinHandle<()>,
}

impl MockHypervisor {
    /// Listen at `path` right away.
    pub fn bind(path: &Path) -> Self {
        let listener = UnixListener::bind(path).unwrap();
        let state = Arc::new(Mutex::new(MockState::default()));
        let task = tokio::spawn(serve(listener, state.clone()));
        Self {
            path: path.to_owned(),
            state,
            task,
        }
    }

    /// Listen at `path` once `delay` has passed, like a freshly spawned
    /// hypervisor still booting.
    pub fn bind_after(path: &Path, delay: Duration) -> Self {
        let state = Arc::new(Mutex::new(MockState::default()));
        let shared = state.clone();
        let socket = path.to_owned();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let listener = UnixListener::bind(&socket).unwrap();
            serve(listener, shared).await;
        });
        Self {
            path: path.to_owned(),
            state,
            task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_vm_state(&self, vm_state: &str) {
        self.state.lock().unwrap().vm_state = vm_state.to_owned();
    }

    pub fn vm_state(&self) -> String {
        self.state.lock().unwrap().vm_state.clone()
    }

    pub fn set_memory(&self, memory: &[u8]) {
        self.state.lock().unwrap().memory = memory.to_vec();
    }

    pub fn memory(&self) -> Vec<u8> {
        self.state.lock().unwrap().memory.clone()
    }

    pub fn fail(&self, method: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(format!("{method} {path}"));
    }

    pub fn stall(&self, method: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .stalled
            .insert(format!("{method} {path}"));
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    /// `"METHOD /path"` of every request, in order.
    pub fn request_lines(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

impl Drop for MockHypervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: UnixListener, state: Arc<Mutex<MockState>>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(handle_connection(stream, state.clone()));
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<Mutex<MockState>>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_owned();
        let path = parts.next().unwrap_or_default().to_owned();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            match reader.read_line(&mut header).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':')
                && name.trim().eq_ignore_ascii_case("content-length")
            {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }
        let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

        let stalled = {
            let mut state = state.lock().unwrap();
            state.requests.push(Recorded {
                method: method.clone(),
                path: path.clone(),
                body: body.clone(),
            });
            state.stalled.contains(&format!("{method} {path}"))
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let (status, reply) = respond(&state, &method, &path, body);
        let response = match reply {
            Some(reply) => {
                let reply = reply.to_string();
                format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{reply}",
                    reply.len()
                )
            }
            None => format!("HTTP/1.1 {status}\r\n\r\n"),
        };
        if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn fault(message: impl Into<String>) -> (&'static str, Option<Value>) {
    (
        "400 Bad Request",
        Some(json!({ "fault_message": message.into() })),
    )
}

const NO_CONTENT: (&str, Option<Value>) = ("204 No Content", None);

fn respond(
    state: &Mutex<MockState>,
    method: &str,
    path: &str,
    body: Value,
) -> (&'static str, Option<Value>) {
    let mut state = state.lock().unwrap();
    if state.failing.contains(&format!("{method} {path}")) {
        return fault(format!("injected failure for {method} {path}"));
    }

    match (method, path) {
        ("GET", "/") => (
            "200 OK",
            Some(json!({
                "id": "mock-vm",
                "state": state.vm_state,
                "vmm_version": "1.10.1",
                "app_name": "Firecracker",
            })),
        ),
        ("PUT", "/boot-source") | ("PUT", "/machine-config") => NO_CONTENT,
        ("PUT", p) if p.starts_with("/drives/") => NO_CONTENT,
        ("PUT", "/actions") => match body["action_type"].as_str() {
            Some("InstanceStart") => {
                state.vm_state = "Running".to_owned();
                NO_CONTENT
            }
            Some("SendCtrlAltDel") => NO_CONTENT,
            _ => fault("unknown action"),
        },
        ("PATCH", "/vm") => match body["state"].as_str() {
            Some("Paused") => {
                state.vm_state = "Paused".to_owned();
                NO_CONTENT
            }
            Some("Resumed") => {
                state.vm_state = "Running".to_owned();
                NO_CONTENT
            }
            _ => fault("unknown vm state"),
        },
        ("PUT", "/snapshot/create") => {
            if state.vm_state != "Paused" {
                return fault("Cannot create snapshot: the microVM is not paused");
            }
            let (Some(mem), Some(snap)) = (
                body["mem_file_path"].as_str(),
                body["snapshot_path"].as_str(),
            ) else {
                return fault("missing snapshot paths");
            };
            let device_state = json!({ "snapshot_type": body["snapshot_type"] }).to_string();
            if std::fs::write(mem, &state.memory).is_err()
                || std::fs::write(snap, device_state).is_err()
            {
                return fault("cannot write snapshot files");
            }
            NO_CONTENT
        }
        ("PUT", "/snapshot/load") => {
            if state.vm_state != "Not started" {
                return fault("Loading a snapshot is only allowed before boot");
            }
            let Some(mem) = body["mem_backend"]["backend_path"].as_str() else {
                return fault("missing memory backend");
            };
            match std::fs::read(mem) {
                Ok(memory) => state.memory = memory,
                Err(e) => return fault(format!("cannot read {mem}: {e}")),
            }
            state.vm_state = if body["resume_vm"].as_bool() == Some(true) {
                "Running".to_owned()
            } else {
                "Paused".to_owned()
            };
            NO_CONTENT
        }
        _ => ("404 Not Found", Some(json!({ "fault_message": "no such route" }))),
    }
}

/// Write an executable shell script standing in for the hypervisor binary.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Whether `pid` names a process that has not exited (zombies count as gone).
pub fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}
