// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter, Read, Seek, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, trace};
use zip::{CompressionMethod, DateTime, ZipArchive, result::ZipError, write::SimpleFileOptions};

use crate::stream;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read zip")]
    Zip(#[source] ZipError),
    #[error("Unsafe entry path in zip: {0:?}")]
    UnsafePath(String),
    #[error("Duplicate file name in zip: {0:?}")]
    DuplicateName(String),
    #[error("Zip contains no files")]
    Empty,
    #[error("Failed to extract zip entry: {0:?}")]
    Extract(PathBuf, #[source] io::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Extract(_, e) => stream::is_cancelled(e),
            Self::Zip(ZipError::Io(e)) => stream::is_cancelled(e),
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Options for entries written by apkpatch. The timestamp is fixed so the same
/// inputs always produce the same bytes.
pub fn file_options(method: CompressionMethod) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .last_modified_time(DateTime::default())
        .compression_method(method)
        .unix_permissions(0o644)
}

/// Extract every file in the archive into `directory`, flattened to its bare
/// file name. Directory entries are skipped. Returns file name to extracted
/// path, sorted by name.
pub fn extract_flat(
    reader: impl Read + Seek,
    directory: &Path,
    cancel_signal: &AtomicBool,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut archive = ZipArchive::new(reader).map_err(Error::Zip)?;
    let mut extracted = BTreeMap::new();

    for index in 0..archive.len() {
        stream::check_cancel(cancel_signal).map_err(|e| Error::Extract(directory.to_owned(), e))?;

        let mut entry = archive.by_index(index).map_err(Error::Zip)?;
        if entry.is_dir() {
            continue;
        }

        let name = entry
            .enclosed_name()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .ok_or_else(|| Error::UnsafePath(entry.name().to_owned()))?;

        if extracted.contains_key(&name) {
            return Err(Error::DuplicateName(name));
        }

        let path = directory.join(&name);
        trace!("Extracting {:?} -> {path:?}", entry.name());

        let file = File::create(&path).map_err(|e| Error::Extract(path.clone(), e))?;
        let mut writer = BufWriter::new(file);

        stream::copy(&mut entry, &mut writer, cancel_signal)
            .and_then(|_| writer.flush())
            .map_err(|e| Error::Extract(path.clone(), e))?;

        extracted.insert(name, path);
    }

    if extracted.is_empty() {
        return Err(Error::Empty);
    }

    debug!("Extracted {} files to {directory:?}", extracted.len());

    Ok(extracted)
}
