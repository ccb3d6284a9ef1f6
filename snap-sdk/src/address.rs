//! Control-channel address and its on-disk lifecycle.
//!
//! The hypervisor binds its API socket at a filesystem path. A socket file
//! left behind by an earlier run makes that bind fail, so the path is cleared
//! before every launch and released again when the owning operation ends.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filesystem path of the hypervisor's Unix API socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelAddress(PathBuf);

impl ChannelAddress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Claim the address for a new hypervisor process.
    ///
    /// Removes any stale socket file and creates the parent directory. The
    /// returned lease removes the socket file again when dropped.
    pub fn bind(&self) -> Result<AddressLease> {
        match std::fs::symlink_metadata(&self.0) {
            Ok(meta) if meta.is_dir() => {
                return Err(Error::InvalidConfig(format!(
                    "socket path {} is a directory",
                    self.0.display()
                )));
            }
            Ok(_) => {
                tracing::warn!(path = %self.0.display(), "removing stale control socket");
                std::fs::remove_file(&self.0)?;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = self.0.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Ok(AddressLease {
            address: self.clone(),
            released: false,
        })
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for ChannelAddress {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&str> for ChannelAddress {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

/// Exclusive claim on a [`ChannelAddress`] for the lifetime of one VM.
///
/// Dropping the lease removes the socket file.
#[derive(Debug)]
pub struct AddressLease {
    address: ChannelAddress,
    released: bool,
}

impl AddressLease {
    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    /// Remove the socket file now. Later calls and the drop are no-ops.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_file(self.address.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(path = %self.address, error = %e, "failed to release control socket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.sock");
        std::fs::write(&path, b"stale").unwrap();

        let lease = ChannelAddress::new(&path).bind().unwrap();
        assert!(!path.exists());
        assert_eq!(lease.address().path(), path);
    }

    #[test]
    fn test_bind_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("vm").join("fc.sock");

        let _lease = ChannelAddress::new(&path).bind().unwrap();
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_bind_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChannelAddress::new(dir.path()).bind().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_lease_drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.sock");

        {
            let _lease = ChannelAddress::new(&path).bind().unwrap();
            std::fs::write(&path, b"").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fc.sock");

        let mut lease = ChannelAddress::new(&path).bind().unwrap();
        std::fs::write(&path, b"").unwrap();
        lease.release().unwrap();
        std::fs::write(&path, b"recreated by someone else").unwrap();
        lease.release().unwrap();
        drop(lease);
        assert!(path.exists());
    }
}
