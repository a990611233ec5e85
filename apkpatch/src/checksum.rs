// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use ring::digest::Context;
use serde::{Deserialize, Serialize};

use crate::{
    progress::Reporter,
    store::{self, Store},
    stream::{self, HashingReader},
};

/// Every file the engine tracks. The role, not the path, is the key under
/// which a file's checksum is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileRole {
    /// The live save data inside the target app's storage.
    SaveData,
    /// Save data as it was before the app was first patched.
    SaveDataBackup,
    /// An older save backup set aside while a new patch run is in flight.
    PriorSaveDataBackup,
    /// Copy of the live save data taken at the start of a run.
    SaveDataSnapshot,
    /// The currently installed APK. Never stored.
    InstalledApk,
    /// The original, unpatched APK.
    ApkBackup,
    /// The patched and re-signed APK.
    SignedApk,
    /// The original OBB.
    ObbBackup,
    /// The OBB inside the target app's storage.
    InstalledObb,
    /// Downloaded script archive.
    Scripts,
}

impl FileRole {
    pub fn key(self) -> &'static str {
        match self {
            Self::SaveData => "savedata",
            Self::SaveDataBackup => "savedata-backup",
            Self::PriorSaveDataBackup => "savedata-prior",
            Self::SaveDataSnapshot => "savedata-snapshot",
            Self::InstalledApk => "installed-apk",
            Self::ApkBackup => "apk-backup",
            Self::SignedApk => "signed-apk",
            Self::ObbBackup => "obb-backup",
            Self::InstalledObb => "installed-obb",
            Self::Scripts => "scripts",
        }
    }
}

impl fmt::Display for FileRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Durable role to hash mapping. A hash is only ever set right after the
/// file's bytes are final on disk, and removed whenever the file goes away.
pub trait ChecksumStore {
    fn get(&self, role: FileRole) -> Option<&str>;

    fn set(&mut self, role: FileRole, hash: &str) -> Result<(), store::Error>;

    fn remove(&mut self, role: FileRole) -> Result<(), store::Error>;

    fn contains(&self, role: FileRole) -> bool {
        self.get(role).is_some()
    }
}

impl ChecksumStore for Store {
    fn get(&self, role: FileRole) -> Option<&str> {
        self.state().checksums.get(role.key()).map(|h| h.as_str())
    }

    fn set(&mut self, role: FileRole, hash: &str) -> Result<(), store::Error> {
        let hash = hash.to_ascii_lowercase();
        self.update(|s| {
            s.checksums.insert(role.key().to_owned(), hash);
        })
    }

    fn remove(&mut self, role: FileRole) -> Result<(), store::Error> {
        self.update(|s| {
            s.checksums.remove(role.key());
        })
    }
}

/// Compare two hex digests, ignoring case.
pub fn hashes_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Hash everything from `reader` in [`stream::CHUNK_SIZE`] chunks, reporting
/// progress against `total` bytes. Partial state is discarded on
/// cancellation.
pub fn hash_reader(
    reader: impl Read,
    total: Option<u64>,
    reporter: &Reporter,
) -> io::Result<String> {
    let context = Context::new(&ring::digest::SHA256);
    let mut hashing_reader = HashingReader::new(reader, context);
    let mut done = 0;

    stream::copy_inspect(
        &mut hashing_reader,
        io::sink(),
        |buf| {
            done += buf.len() as u64;
            reporter.progress(done, total);
        },
        reporter.cancel_signal(),
    )?;

    let (_, context) = hashing_reader.finish();

    Ok(hex::encode(context.finish()))
}

/// Hash a file on disk.
pub fn hash_file(path: &Path, reporter: &Reporter) -> io::Result<String> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();

    hash_reader(BufReader::new(file), Some(size), reporter)
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&ring::digest::SHA256, data))
}
