//! Binary provisioning
//!
//! The engine and relay executables are supplied from outside (bundled,
//! downloaded, installed by a package manager). The session only asks a
//! [`BinaryProvider`] for a path it can execute.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supplies an executable path
pub trait BinaryProvider: Send + Sync {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Make sure the binary exists and is executable, returning its path
    fn ensure_present(&self) -> Result<PathBuf>;
}

/// Executable already on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalBinary {
    name: String,
    path: PathBuf,
}

impl LocalBinary {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl BinaryProvider for LocalBinary {
    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_present(&self) -> Result<PathBuf> {
        let metadata = fs::metadata(&self.path).map_err(|e| {
            Error::BinaryUnavailable(format!("{} at {}: {}", self.name, self.path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(Error::BinaryUnavailable(format!(
                "{} at {} is not a file",
                self.name,
                self.path.display()
            )));
        }

        make_executable(&self.path, metadata).map_err(|e| {
            Error::BinaryUnavailable(format!("{}: cannot set exec permission: {}", self.name, e))
        })?;

        Ok(self.path.clone())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path, metadata: fs::Metadata) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o100 == 0 {
        permissions.set_mode(mode | 0o700);
        fs::set_permissions(path, permissions)?;
        debug!("Set exec permission on {}", path.display());
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path, _metadata: fs::Metadata) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_binary() {
        let dir = TempDir::new().unwrap();
        let binary = LocalBinary::new("xray", dir.path().join("xray"));

        let err = binary.ensure_present().unwrap_err();
        assert!(matches!(err, Error::BinaryUnavailable(_)));
        assert!(err.to_string().contains("xray"));
    }

    #[test]
    fn test_directory_rejected() {
        let dir = TempDir::new().unwrap();
        let binary = LocalBinary::new("xray", dir.path());
        assert!(matches!(
            binary.ensure_present().unwrap_err(),
            Error::BinaryUnavailable(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_sets_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tun2socks");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let binary = LocalBinary::new("tun2socks", &path);
        assert_eq!(binary.ensure_present().unwrap(), path);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);
    }
}
