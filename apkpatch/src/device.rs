// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Package is not installed: {0}")]
    NotInstalled(String),
    #[error("Failed to query free space: {0:?}")]
    FreeSpace(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Queries about the target app and the storage the engine works in.
pub trait Device: Send + Sync {
    fn is_installed(&self, package: &str) -> Result<bool>;

    /// Path of the currently installed APK.
    fn installed_apk(&self, package: &str) -> Result<PathBuf>;

    /// Bytes available to unprivileged writers on the filesystem containing
    /// `path`.
    fn free_space(&self, path: &Path) -> Result<u64>;
}

/// A device whose app files are reachable as plain paths on this machine.
#[derive(Clone, Debug)]
pub struct LocalDevice {
    apk: PathBuf,
}

impl LocalDevice {
    pub fn new(apk: PathBuf) -> Self {
        Self { apk }
    }
}

impl Device for LocalDevice {
    fn is_installed(&self, _package: &str) -> Result<bool> {
        Ok(self.apk.is_file())
    }

    fn installed_apk(&self, package: &str) -> Result<PathBuf> {
        if !self.apk.is_file() {
            return Err(Error::NotInstalled(package.to_owned()));
        }

        Ok(self.apk.clone())
    }

    fn free_space(&self, path: &Path) -> Result<u64> {
        free_space(path)
    }
}

/// The managed root may not exist yet, so query the nearest existing ancestor.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."))
}

#[cfg(unix)]
pub fn free_space(path: &Path) -> Result<u64> {
    let path = existing_ancestor(path);
    let stat = rustix::fs::statvfs(path).map_err(|e| Error::FreeSpace(path.to_owned(), e.into()))?;

    Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
}

#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> Result<u64> {
    Ok(u64::MAX)
}
