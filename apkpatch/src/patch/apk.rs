// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, trace};
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError};

use crate::{
    checksum,
    format::{
        jar,
        zip::{self as zip_format, file_options},
    },
    progress::Reporter,
    sign::{self, ApkSigner},
    stream, util,
};

/// Where extracted scripts are placed inside the APK.
pub const SCRIPT_DIR: &str = "assets/script/";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read APK: {0:?}")]
    ApkRead(PathBuf, #[source] ZipError),
    #[error("Failed to write unsigned APK")]
    ApkWrite(#[source] ZipError),
    #[error("Failed to extract script archive: {0:?}")]
    Scripts(PathBuf, #[source] zip_format::Error),
    #[error("Failed to sign APK")]
    Sign(#[source] sign::Error),
    #[error("Failed to {0}: {1:?}")]
    Io(&'static str, PathBuf, #[source] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::ApkRead(_, ZipError::Io(e)) | Self::ApkWrite(ZipError::Io(e)) => {
                stream::is_cancelled(e)
            }
            Self::Scripts(_, e) => e.is_cancelled(),
            Self::Sign(e) => e.is_cancelled(),
            Self::Io(_, _, e) => stream::is_cancelled(e),
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A fully signed APK waiting next to its destination.
///
/// Dropping it deletes the temporary file and leaves the destination alone.
pub struct SignedApk {
    file: NamedTempFile,
    output: PathBuf,
    hash: String,
}

impl SignedApk {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Move the signed APK onto its destination. Returns its hash.
    pub fn persist(self) -> Result<String> {
        self.file
            .persist(&self.output)
            .map_err(|e| Error::Io("persist file", self.output.clone(), e.error))?;

        debug!("Signed APK: {:?}: {}", self.output, self.hash);

        Ok(self.hash)
    }
}

/// Inject every file from the `scripts` archive into `apk` under
/// [`SCRIPT_DIR`], drop the old signature and sign the result with `signer`.
///
/// All intermediate files live next to `output` and are deleted whether or
/// not this succeeds. `output` is not touched until [`SignedApk::persist`].
pub fn patch(
    apk: &Path,
    scripts: &Path,
    signer: &dyn ApkSigner,
    output: &Path,
    reporter: &Reporter,
) -> Result<SignedApk> {
    let parent = util::parent_path(output);
    let cancel_signal = reporter.cancel_signal();

    std::fs::create_dir_all(parent)
        .map_err(|e| Error::Io("create directory", parent.into(), e))?;

    reporter.step("Extracting scripts");
    reporter.indeterminate();

    let scratch = tempfile::Builder::new()
        .prefix(".scripts")
        .tempdir_in(parent)
        .map_err(|e| Error::Io("create scratch directory", parent.into(), e))?;

    let scripts_file =
        File::open(scripts).map_err(|e| Error::Io("open file", scripts.into(), e))?;
    let extracted = zip_format::extract_flat(
        BufReader::new(scripts_file),
        scratch.path(),
        cancel_signal,
    )
    .map_err(|e| Error::Scripts(scripts.into(), e))?;

    reporter.step("Rewriting APK");

    let mut unsigned = NamedTempFile::with_prefix_in(".unsigned", parent)
        .map_err(|e| Error::Io("create temp file", parent.into(), e))?;
    let unsigned_path = unsigned.path().to_owned();

    {
        let apk_file = File::open(apk).map_err(|e| Error::Io("open file", apk.into(), e))?;
        let mut archive =
            ZipArchive::new(BufReader::new(apk_file)).map_err(|e| Error::ApkRead(apk.into(), e))?;
        let mut writer = ZipWriter::new(BufWriter::new(unsigned.as_file_mut()));

        let total = (archive.len() + extracted.len()) as u64;
        let mut done = 0;

        for index in 0..archive.len() {
            stream::check_cancel(cancel_signal)
                .map_err(|e| Error::ApkWrite(ZipError::Io(e)))?;

            let entry = archive
                .by_index_raw(index)
                .map_err(|e| Error::ApkRead(apk.into(), e))?;
            let name = entry.name();

            let replaced = name
                .strip_prefix(SCRIPT_DIR)
                .is_some_and(|n| extracted.contains_key(n));

            if jar::is_signature_entry(name) || replaced {
                trace!("Skipping entry: {name:?}");
            } else {
                writer.raw_copy_file(entry).map_err(Error::ApkWrite)?;
            }

            done += 1;
            reporter.progress(done, Some(total));
        }

        for (name, path) in &extracted {
            let entry_name = format!("{SCRIPT_DIR}{name}");
            debug!("Adding script: {entry_name:?}");

            writer
                .start_file(entry_name.as_str(), file_options(CompressionMethod::Deflated))
                .map_err(Error::ApkWrite)?;

            let script = File::open(path).map_err(|e| Error::Io("open file", path.clone(), e))?;
            stream::copy(BufReader::new(script), &mut writer, cancel_signal)
                .map_err(|e| Error::Io("write script", path.clone(), e))?;

            done += 1;
            reporter.progress(done, Some(total));
        }

        let mut buf_writer = writer.finish().map_err(Error::ApkWrite)?;
        buf_writer
            .flush()
            .map_err(|e| Error::Io("flush file", unsigned_path.clone(), e))?;
    }

    // The scripts are inside the unsigned APK now.
    drop(scratch);

    reporter.step("Signing APK");
    reporter.indeterminate();

    unsigned
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::Io("seek file", unsigned_path.clone(), e))?;

    let mut signed = NamedTempFile::with_prefix_in(".signed", parent)
        .map_err(|e| Error::Io("create temp file", parent.into(), e))?;

    {
        let mut reader = BufReader::new(unsigned.as_file_mut());
        let mut writer = BufWriter::new(signed.as_file_mut());

        signer
            .sign(&mut reader, &mut writer, cancel_signal)
            .map_err(Error::Sign)?;

        writer
            .flush()
            .map_err(|e| Error::Io("flush file", output.into(), e))?;
    }

    drop(unsigned);

    signed
        .as_file()
        .sync_all()
        .map_err(|e| Error::Io("sync file", output.into(), e))?;

    let hash = checksum::hash_file(signed.path(), reporter)
        .map_err(|e| Error::Io("hash file", output.into(), e))?;

    Ok(SignedApk {
        file: signed,
        output: output.to_owned(),
        hash,
    })
}
