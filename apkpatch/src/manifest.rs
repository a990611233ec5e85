// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Fetching the remote manifest with a last-known-good local fallback.
//!
//! The previous manifest is moved aside before every download. A valid
//! download replaces it for good. Anything else (HTTP error, broken
//! connection, unparseable or invalid JSON) discards the new copy and puts the
//! old one back, provided the old one still validates.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    download::{self, Downloader, TransportError},
    file,
    format::manifest::{self, Manifest},
    progress::Reporter,
};

/// Why a freshly fetched manifest was not used.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to save manifest")]
    Write(#[source] file::Error),
    #[error(transparent)]
    Invalid(#[from] manifest::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to fetch manifest and no valid local copy exists")]
    Failed(#[source] FetchError),
    #[error("Manifest retrieval was cancelled")]
    Cancelled,
    #[error("No local manifest: {0:?}")]
    NoLocal(PathBuf),
    #[error("Local manifest is invalid: {0:?}")]
    LocalInvalid(PathBuf, #[source] manifest::Error),
    #[error("Failed to {0}: {1:?}")]
    Io(&'static str, PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetrievalState {
    Idle,
    Downloading,
    Validating,
    /// The fresh manifest was valid.
    Loaded,
    /// The fresh manifest was unusable and the previous copy was restored.
    Fallback,
    /// Neither the fresh nor the previous manifest was usable.
    Failed,
}

#[derive(Debug)]
pub struct Retrieved {
    pub manifest: Manifest,
    /// Set when the previous local copy was used instead of the fresh one.
    pub fallback_reason: Option<FetchError>,
}

pub struct ManifestRetriever {
    url: String,
    primary: PathBuf,
    backup: PathBuf,
    state: RetrievalState,
}

impl ManifestRetriever {
    pub fn new(url: impl Into<String>, primary: PathBuf, backup: PathBuf) -> Self {
        Self {
            url: url.into(),
            primary,
            backup,
            state: RetrievalState::Idle,
        }
    }

    pub fn state(&self) -> RetrievalState {
        self.state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch and validate the remote manifest, falling back to the previous
    /// local copy if the fresh one is unusable.
    pub fn retrieve(
        &mut self,
        downloader: &dyn Downloader,
        reporter: &Reporter,
    ) -> Result<Retrieved> {
        reporter.step("Fetching manifest");
        reporter.indeterminate();

        self.state = RetrievalState::Downloading;

        if self.primary.exists() {
            rename(&self.primary, &self.backup)?;
        }

        let result = download::download_to_path(downloader, &self.url, &self.primary, reporter);

        let fetched = match result {
            Ok(_) => {
                self.state = RetrievalState::Validating;
                read_manifest(&self.primary)
                    .map_err(|e| Error::Io("read manifest", self.primary.clone(), e))?
                    .map_err(FetchError::Invalid)
            }
            Err(e) if e.is_cancelled() => {
                if self.backup.exists() {
                    rename(&self.backup, &self.primary)?;
                }
                self.state = RetrievalState::Idle;
                return Err(Error::Cancelled);
            }
            Err(download::Error::Transport(e)) => Err(FetchError::Transport(e)),
            Err(download::Error::File(e)) => Err(FetchError::Write(e)),
        };

        match fetched {
            Ok(manifest) => {
                remove_if_exists(&self.backup)?;
                self.state = RetrievalState::Loaded;

                info!("Loaded manifest version {}", manifest.version);

                Ok(Retrieved {
                    manifest,
                    fallback_reason: None,
                })
            }
            Err(reason) => {
                warn!("Discarding fetched manifest: {reason}");
                remove_if_exists(&self.primary)?;

                match read_manifest(&self.backup) {
                    Ok(Ok(manifest)) => {
                        rename(&self.backup, &self.primary)?;
                        self.state = RetrievalState::Fallback;

                        reporter.warning(format!(
                            "Could not update manifest ({reason}); using cached version {}",
                            manifest.version,
                        ));

                        Ok(Retrieved {
                            manifest,
                            fallback_reason: Some(reason),
                        })
                    }
                    result => {
                        debug!("Backup manifest is unusable: {result:?}");
                        remove_if_exists(&self.backup)?;
                        self.state = RetrievalState::Failed;

                        Err(Error::Failed(reason))
                    }
                }
            }
        }
    }

    /// Read the last successfully retrieved manifest without touching the
    /// network.
    pub fn load_local(&self) -> Result<Manifest> {
        match read_manifest(&self.primary) {
            Ok(Ok(m)) => Ok(m),
            Ok(Err(e)) => Err(Error::LocalInvalid(self.primary.clone(), e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NoLocal(self.primary.clone()))
            }
            Err(e) => Err(Error::Io("read manifest", self.primary.clone(), e)),
        }
    }
}

/// The outer error is for reading the file, the inner one for its contents.
fn read_manifest(path: &Path) -> io::Result<std::result::Result<Manifest, manifest::Error>> {
    let data = fs::read(path)?;

    Ok(Manifest::from_slice(&data))
}

fn rename(source: &Path, target: &Path) -> Result<()> {
    debug!("Moving {source:?} -> {target:?}");

    fs::rename(source, target).map_err(|e| Error::Io("rename manifest", source.to_owned(), e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io("delete manifest", path.to_owned(), e)),
    }
}
