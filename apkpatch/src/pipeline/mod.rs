// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! The patch and unpatch state machines.
//!
//! A pipeline runs synchronously until it needs the OS to uninstall or install
//! the app. At that point it persists a [`PendingStep`], returns
//! [`Outcome::Suspended`] with the request and ends. The installer's verdict
//! is fed back through [`Context::resume`], possibly in a different process.
//!
//! Nothing is trusted because it exists. Every skip decision goes through
//! [`VerifiableFile::verify`], and checksums are only recorded once the bytes
//! they describe are final.

pub mod patch;
pub mod unpatch;

use std::{
    any::Any,
    fmt, fs,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    checksum::{self, ChecksumStore, FileRole},
    device::{self, Device},
    download::{self, Downloader, TransportError},
    file::{self, Files, Target, VerifiableFile},
    format::manifest::{Artifact, Manifest, ValidationError},
    manifest,
    patch::apk,
    progress::Reporter,
    store::{self, Store, Versions},
    util,
};

/// Refuse to start a pipeline with less free space than this in the managed
/// root.
pub const MIN_FREE_SPACE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineKind {
    Patch,
    Unpatch,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch => f.write_str("patch"),
            Self::Unpatch => f.write_str("unpatch"),
        }
    }
}

/// Stable identifiers of the points where a pipeline can be suspended. These
/// are persisted, so they must never be renamed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    /// Waiting for the OS to report the result of an uninstall.
    AwaitUninstall,
    /// Waiting for the OS to report the result of an install.
    AwaitInstall,
    /// The app is in its final state. Only bookkeeping and restores remain.
    Commit,
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitUninstall => f.write_str("await-uninstall"),
            Self::AwaitInstall => f.write_str("await-install"),
            Self::Commit => f.write_str("commit"),
        }
    }
}

/// Everything needed to finish a suspended run without the manifest that
/// started it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStep {
    pub pipeline: PipelineKind,
    pub step: StepId,
    pub process_savedata: bool,
    #[serde(default)]
    pub update_only: bool,
    #[serde(default)]
    pub obb_download: bool,
    /// Versions to record once the run commits.
    #[serde(default)]
    pub versions: Versions,
    /// OBB to install at commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obb: Option<Artifact>,
}

/// Which components have a newer version in the manifest than what was last
/// applied. Both are false until the app has been patched once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PatchUpdateState {
    pub scripts: bool,
    pub obb: bool,
}

impl PatchUpdateState {
    pub fn compute(patched: bool, applied: Versions, manifest: &Manifest) -> Self {
        if !patched {
            return Self::default();
        }

        Self {
            scripts: applied
                .scripts
                .is_none_or(|v| manifest.scripts.version > v),
            obb: applied.obb.is_none_or(|v| manifest.obb.version > v),
        }
    }

    pub fn update_available(&self) -> bool {
        self.scripts || self.obb
    }
}

/// Immutable configuration of a single run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessState {
    pub process_savedata: bool,
    pub patch_updates: PatchUpdateState,
}

/// Something the OS must do before the pipeline can continue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Uninstall { package: String },
    Install { apk: PathBuf },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninstall { package } => write!(f, "uninstall {package}"),
            Self::Install { apk } => write!(f, "install {apk:?}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Waiting for the OS. Feed the result back with [`Context::resume`].
    Suspended(Request),
    Committed,
}

#[derive(Debug, Error)]
pub enum Precondition {
    #[error("App is already patched and no update is available")]
    AlreadyPatched,
    #[error("App is not patched")]
    NotPatched,
    #[error("App is not installed: {0}")]
    NotInstalled(String),
    #[error("Insufficient free space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },
    #[error("A {0} run is waiting for the installer")]
    Busy(PipelineKind),
}

/// Coarse classification of every failure a pipeline can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    IntegrityMismatch,
    Transport,
    PreconditionFailed,
    Cancelled,
    ExternalHandoffFailed,
    Unexpected,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Precondition(#[from] Precondition),
    #[error("Invalid manifest")]
    Validation(#[source] ValidationError),
    #[error("Failed to retrieve manifest")]
    Manifest(#[source] manifest::Error),
    #[error("Hash mismatch for {role}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        role: FileRole,
        expected: String,
        actual: String,
    },
    #[error("Required file is missing or does not verify: {0}")]
    MissingFile(FileRole),
    #[error(transparent)]
    Transport(TransportError),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Installer reported failure at step {0}")]
    HandoffFailed(StepId),
    #[error("No run is waiting for the installer")]
    NothingPending,
    #[error("File operation failed")]
    File(#[source] file::Error),
    #[error("Failed to patch APK")]
    Patch(#[source] apk::Error),
    #[error("Failed to persist state")]
    Store(#[source] store::Error),
    #[error("Failed to query device")]
    Device(#[source] device::Error),
    #[error("Unexpected failure: {message}")]
    Internal {
        message: String,
        report: Option<PathBuf>,
    },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Precondition(_) | Self::MissingFile(_) | Self::NothingPending => {
                ErrorKind::PreconditionFailed
            }
            Self::Validation(_) => ErrorKind::Validation,
            Self::Manifest(e) => match e {
                manifest::Error::Failed(manifest::FetchError::Transport(_)) => {
                    ErrorKind::Transport
                }
                manifest::Error::Failed(manifest::FetchError::Invalid(_))
                | manifest::Error::LocalInvalid(..) => ErrorKind::Validation,
                manifest::Error::NoLocal(_) => ErrorKind::PreconditionFailed,
                manifest::Error::Cancelled => ErrorKind::Cancelled,
                _ => ErrorKind::Unexpected,
            },
            Self::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::HandoffFailed(_) => ErrorKind::ExternalHandoffFailed,
            Self::File(_)
            | Self::Patch(_)
            | Self::Store(_)
            | Self::Device(_)
            | Self::Internal { .. } => ErrorKind::Unexpected,
        }
    }
}

impl From<file::Error> for Error {
    fn from(e: file::Error) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::File(e)
        }
    }
}

impl From<download::Error> for Error {
    fn from(e: download::Error) -> Self {
        match e {
            download::Error::Transport(e) => Self::Transport(e),
            download::Error::File(e) => e.into(),
        }
    }
}

impl From<apk::Error> for Error {
    fn from(e: apk::Error) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Patch(e)
        }
    }
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Self::Store(e)
    }
}

impl From<device::Error> for Error {
    fn from(e: device::Error) -> Self {
        Self::Device(e)
    }
}

impl From<manifest::Error> for Error {
    fn from(e: manifest::Error) -> Self {
        Self::Manifest(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The engine's view of the world: the managed files, the durable state and
/// the collaborators that talk to the device and the network.
pub struct Context<'a> {
    files: Files,
    store: Store,
    target: Target,
    device: &'a dyn Device,
    downloader: &'a dyn Downloader,
    min_free_space: u64,
}

impl<'a> Context<'a> {
    pub fn open(
        root: &Path,
        target: Target,
        device: &'a dyn Device,
        downloader: &'a dyn Downloader,
    ) -> Result<Self> {
        let files = Files::new(root, &target);
        let store = Store::open(&files.state_path())?;

        Ok(Self {
            files,
            store,
            target,
            device,
            downloader,
            min_free_space: MIN_FREE_SPACE,
        })
    }

    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = bytes;
        self
    }

    pub fn files(&self) -> &Files {
        &self.files
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Update state for `manifest` against what was last applied.
    pub fn update_state(&self, manifest: &Manifest) -> PatchUpdateState {
        PatchUpdateState::compute(self.store.is_patched(), self.store.versions(), manifest)
    }

    fn check_not_busy(&self) -> Result<()> {
        if let Some(pending) = self.store.pending() {
            return Err(Precondition::Busy(pending.pipeline).into());
        }

        Ok(())
    }

    fn check_free_space(&self) -> Result<()> {
        let available = self.device.free_space(self.files.root())?;

        if available < self.min_free_space {
            return Err(Precondition::InsufficientSpace {
                available,
                required: self.min_free_space,
            }
            .into());
        }

        Ok(())
    }

    /// Feed the installer's verdict for the suspended run back in.
    ///
    /// A run suspended at [`StepId::Commit`] failed after the app reached its
    /// final state; resuming it retries the commit regardless of `success`.
    pub fn resume(&mut self, success: bool, reporter: &Reporter) -> Result<Outcome> {
        let pending = self.store.pending().cloned().ok_or(Error::NothingPending)?;

        match (pending.step, success) {
            (StepId::Commit, _) => self.commit(pending, reporter),
            (StepId::AwaitUninstall, true) => {
                let next = PendingStep {
                    step: StepId::AwaitInstall,
                    ..pending
                };
                let apk = self.install_source(next.pipeline);
                self.store.set_pending(Some(next))?;

                Ok(Outcome::Suspended(Request::Install { apk }))
            }
            (StepId::AwaitInstall, true) => {
                let next = PendingStep {
                    step: StepId::Commit,
                    ..pending
                };
                self.store.set_pending(Some(next.clone()))?;

                self.commit(next, reporter)
            }
            (step, false) => {
                // After a successful uninstall, the snapshot is the only copy
                // of the user's save data.
                let uninstalled = step == StepId::AwaitInstall && !pending.update_only;

                match pending.pipeline {
                    PipelineKind::Patch => self.rollback_patch(uninstalled, reporter)?,
                    PipelineKind::Unpatch => self.rollback_unpatch(uninstalled, reporter)?,
                }

                Err(Error::HandoffFailed(step))
            }
        }
    }

    fn install_source(&self, pipeline: PipelineKind) -> PathBuf {
        match pipeline {
            PipelineKind::Patch => self.files.signed_apk.full_path(),
            PipelineKind::Unpatch => self.files.apk_backup.full_path(),
        }
    }

    fn commit(&mut self, pending: PendingStep, reporter: &Reporter) -> Result<Outcome> {
        match pending.pipeline {
            PipelineKind::Patch => self.commit_patch(&pending, reporter)?,
            PipelineKind::Unpatch => self.commit_unpatch(&pending, reporter)?,
        }

        Ok(Outcome::Committed)
    }

    /// Move the prior save backup back into the backup slot if it verifies.
    fn recover_prior_backup(&mut self, reporter: &Reporter) -> Result<bool> {
        let files = &self.files;

        if !files.savedata_prior.verify(&self.store, reporter)? {
            return Ok(false);
        }

        files.savedata_backup.delete_if_exists(&mut self.store)?;
        files
            .savedata_prior
            .move_to(&files.savedata_backup, &mut self.store)?;

        Ok(true)
    }
}

/// Download `artifact` into `file` and record its hash, unless the file
/// already verifies against the artifact's hash. On a hash mismatch the
/// download is deleted and no checksum is recorded. Returns whether anything
/// was downloaded.
fn fetch_artifact(
    store: &mut Store,
    downloader: &dyn Downloader,
    artifact: &Artifact,
    file: &VerifiableFile,
    reporter: &Reporter,
) -> Result<bool> {
    let recorded_matches = store
        .get(file.role())
        .is_some_and(|h| checksum::hashes_equal(h, &artifact.hash));

    if recorded_matches && file.verify(&*store, reporter)? {
        return Ok(false);
    }

    file.delete_if_exists(store)?;

    let actual = download::download_to(downloader, &artifact.url, file, reporter)?;

    if !checksum::hashes_equal(&actual, &artifact.hash) {
        file.delete_if_exists(store)?;

        return Err(Error::IntegrityMismatch {
            role: file.role(),
            expected: artifact.hash.to_ascii_lowercase(),
            actual,
        });
    }

    file.record(store, &actual)?;

    Ok(true)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_owned()
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();

    while let Some(s) = source {
        message.push_str(": ");
        message.push_str(&s.to_string());
        source = s.source();
    }

    message
}

/// Write a bug report under `root`. Returns its path if that worked.
pub fn write_bug_report(root: &Path, message: &str, details: &str) -> Option<PathBuf> {
    let path = root.join(format!("bugreport-{}.txt", util::unix_time()));
    let contents = format!(
        "apkpatch {}\n\n{message}\n\n{details}\n",
        env!("CARGO_PKG_VERSION"),
    );

    let result = fs::create_dir_all(root).and_then(|_| fs::write(&path, contents));

    match result {
        Ok(()) => Some(path),
        Err(e) => {
            warn!("Failed to write bug report: {path:?}: {e}");
            None
        }
    }
}

/// Outermost boundary of a pipeline. Failures of a known kind pass through.
/// Unexpected failures, including panics, are written to a bug report under
/// `root` and surfaced as [`Error::Internal`].
pub fn run_guarded<T>(root: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() != ErrorKind::Unexpected => Err(e),
        Ok(Err(e)) if matches!(e, Error::Internal { .. }) => Err(e),
        Ok(Err(e)) => {
            let message = error_chain(&e);
            error!("Unexpected failure: {message}");

            let report = write_bug_report(root, &message, &format!("{e:#?}"));

            Err(Error::Internal { message, report })
        }
        Err(payload) => {
            let message = format!("Panic: {}", panic_message(payload.as_ref()));
            error!("{message}");

            let report = write_bug_report(root, &message, "");

            Err(Error::Internal { message, report })
        }
    }
}
