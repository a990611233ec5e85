// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Durable engine state: checksums, the patched flag, per-component version
//! counters and the suspended pipeline step. Everything lives in a single
//! TOML document that is rewritten atomically on every mutation.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::{pipeline::PendingStep, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read state file: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse state file: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Failed to serialize state")]
    Serialize(#[source] toml_edit::ser::Error),
    #[error("Failed to write state file: {0:?}")]
    Write(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Last-applied versions of each patch component. Only meaningful while the
/// app is patched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obb: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub patched: bool,
    #[serde(default)]
    pub versions: Versions,
    /// Role key to lowercase hex SHA-256 digest.
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStep>,
}

/// File-backed [`State`]. Reads are served from memory and every update is
/// persisted before it becomes visible.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    state: State,
}

impl Store {
    /// Open the state file at `path`. A missing file is an empty state.
    pub fn open(path: &Path) -> Result<Self> {
        let state = match fs::read_to_string(path) {
            Ok(contents) => toml_edit::de::from_str(&contents)
                .map_err(|e| Error::Parse(path.to_owned(), e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(Error::Read(path.to_owned(), e)),
        };

        Ok(Self {
            path: path.to_owned(),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Apply `f` to a copy of the state, persist it, and only then make it
    /// the current state. If persisting fails, nothing changes.
    pub fn update(&mut self, f: impl FnOnce(&mut State)) -> Result<()> {
        let mut new_state = self.state.clone();
        f(&mut new_state);

        if new_state != self.state {
            self.write(&new_state)?;
            self.state = new_state;
        }

        Ok(())
    }

    fn write(&self, state: &State) -> Result<()> {
        let data = toml_edit::ser::to_string_pretty(state).map_err(Error::Serialize)?;
        let parent = util::parent_path(&self.path);

        fs::create_dir_all(parent).map_err(|e| Error::Write(parent.to_owned(), e))?;

        let mut temp = NamedTempFile::with_prefix_in(".state", parent)
            .map_err(|e| Error::Write(self.path.clone(), e))?;
        temp.write_all(data.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| Error::Write(temp.path().to_owned(), e))?;
        temp.persist(&self.path)
            .map_err(|e| Error::Write(self.path.clone(), e.error))?;

        debug!("Persisted state: {:?}", self.path);

        Ok(())
    }

    pub fn is_patched(&self) -> bool {
        self.state.patched
    }

    pub fn versions(&self) -> Versions {
        self.state.versions
    }

    pub fn pending(&self) -> Option<&PendingStep> {
        self.state.pending.as_ref()
    }

    pub fn set_pending(&mut self, pending: Option<PendingStep>) -> Result<()> {
        self.update(|s| s.pending = pending)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn missing_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.toml")).unwrap();

        assert_eq!(store.state(), &State::default());
        assert!(!dir.path().join("state.toml").exists());
    }

    #[test]
    fn updates_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.toml");

        let mut store = Store::open(&path).unwrap();
        store
            .update(|s| {
                s.patched = true;
                s.versions.scripts = Some(3);
                s.checksums.insert("scripts".into(), "abcd".into());
            })
            .unwrap();

        let reopened = Store::open(&path).unwrap();
        assert!(reopened.is_patched());
        assert_eq!(
            reopened.versions(),
            Versions {
                scripts: Some(3),
                obb: None
            },
        );
        assert_eq!(reopened.state().checksums["scripts"], "abcd");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");
        fs::write(&path, "patched = [").unwrap();

        assert!(matches!(Store::open(&path), Err(Error::Parse(..))));
    }

    #[test]
    fn no_op_update_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.toml");

        let mut store = Store::open(&path).unwrap();
        store.update(|_| {}).unwrap();

        assert!(!path.exists());
    }
}
