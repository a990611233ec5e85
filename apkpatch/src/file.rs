// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use ring::digest::Context;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    checksum::{self, ChecksumStore, FileRole},
    progress::Reporter,
    store,
    stream::{self, HashingWriter},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to {0}: {1:?}")]
    Io(&'static str, PathBuf, #[source] io::Error),
    #[error("Failed to update checksum for {0}")]
    Store(FileRole, #[source] store::Error),
}

impl Error {
    /// Whether the operation stopped because of the cancel signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Io(_, _, e) if stream::is_cancelled(e))
    }
}

type Result<T> = std::result::Result<T, Error>;

/// A handle to a file with a well-known role. Existence alone means nothing:
/// only [`Self::verify`] says whether the file is the one whose hash was
/// recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiableFile {
    directory: PathBuf,
    file_name: String,
    role: FileRole,
}

impl VerifiableFile {
    pub fn new(
        directory: impl Into<PathBuf>,
        file_name: impl Into<String>,
        role: FileRole,
    ) -> Self {
        Self {
            directory: directory.into(),
            file_name: file_name.into(),
            role,
        }
    }

    /// Split an absolute path into a handle.
    pub fn from_path(path: &Path, role: FileRole) -> Self {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self::new(crate::util::parent_path(path), file_name, role)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn role(&self) -> FileRole {
        self.role
    }

    pub fn full_path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    /// Sibling path used while the file is being written.
    pub fn partial_path(&self) -> PathBuf {
        partial_path(&self.full_path())
    }

    pub fn exists(&self) -> bool {
        self.full_path().is_file()
    }

    /// Compute the file's hash.
    pub fn hash(&self, reporter: &Reporter) -> Result<String> {
        let path = self.full_path();

        checksum::hash_file(&path, reporter).map_err(|e| Error::Io("hash file", path, e))
    }

    /// Check the file against the hash recorded for its role. Returns `false`
    /// without reading anything if there is no recorded hash or no file.
    pub fn verify(&self, store: &dyn ChecksumStore, reporter: &Reporter) -> Result<bool> {
        let Some(expected) = store.get(self.role) else {
            trace!("No checksum recorded for {}", self.role);
            return Ok(false);
        };

        if !self.exists() {
            trace!("File for {} does not exist: {:?}", self.role, self.full_path());
            return Ok(false);
        }

        self.verify_against(expected, reporter)
    }

    /// Check the file against an explicitly provided hash.
    pub fn verify_against(&self, expected: &str, reporter: &Reporter) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }

        let actual = self.hash(reporter)?;
        let matches = checksum::hashes_equal(&actual, expected);

        debug!(
            "Verified {}: {:?}: {}",
            self.role,
            self.full_path(),
            if matches { "match" } else { "mismatch" },
        );

        Ok(matches)
    }

    /// Record `hash` as the checksum for this file's role. Only call this once
    /// the bytes are final on disk.
    pub fn record(&self, store: &mut dyn ChecksumStore, hash: &str) -> Result<()> {
        store
            .set(self.role, hash)
            .map_err(|e| Error::Store(self.role, e))
    }

    /// Forget the checksum for this file's role.
    pub fn forget(&self, store: &mut dyn ChecksumStore) -> Result<()> {
        store.remove(self.role).map_err(|e| Error::Store(self.role, e))
    }

    /// Delete the file and its recorded checksum. The checksum goes first so
    /// that a crash in between cannot leave a hash describing a file that is
    /// half gone.
    pub fn delete_if_exists(&self, store: &mut dyn ChecksumStore) -> Result<()> {
        self.forget(store)?;
        remove_if_exists(&self.full_path())?;
        remove_if_exists(&self.partial_path())
    }

    /// Rename the file onto `other`, carrying the recorded checksum along.
    pub fn move_to(&self, other: &VerifiableFile, store: &mut dyn ChecksumStore) -> Result<()> {
        let source = self.full_path();
        let target = other.full_path();
        let hash = store.get(self.role).map(|h| h.to_owned());

        debug!("Moving {source:?} -> {target:?}");

        other.forget(store)?;
        create_parent(&target)?;
        fs::rename(&source, &target).map_err(|e| Error::Io("rename file", source, e))?;

        if let Some(h) = hash {
            other.record(store, &h)?;
        }
        self.forget(store)
    }

    /// Copy the file onto `other` and record the hash of the copied bytes for
    /// `other`'s role. The copy is streamed into a `.part` file that only
    /// replaces the destination once complete, so the destination is never a
    /// truncated file.
    pub fn copy_to(
        &self,
        other: &VerifiableFile,
        store: &mut dyn ChecksumStore,
        reporter: &Reporter,
    ) -> Result<String> {
        let source = self.full_path();

        let reader = File::open(&source).map_err(|e| Error::Io("open file", source.clone(), e))?;
        let size = reader
            .metadata()
            .map_err(|e| Error::Io("stat file", source.clone(), e))?
            .len();

        debug!(
            "Copying {:?} {source:?} -> {:?}",
            NumBytes(size),
            other.full_path(),
        );

        let target = other.full_path();
        let (partial, hash) = write_partial(&target, reporter, |writer| {
            let mut done = 0;
            stream::copy_inspect(
                BufReader::new(reader),
                writer,
                |buf| {
                    done += buf.len() as u64;
                    reporter.progress(done, Some(size));
                },
                reporter.cancel_signal(),
            )
        })?;

        // Until here, the destination and its checksum are untouched.
        if let Err(e) = other.forget(store) {
            let _ = remove_if_exists(&partial);
            return Err(e);
        }
        rename_partial(&partial, &target)?;
        other.record(store, &hash)?;

        Ok(hash)
    }

    /// Stream new contents into the file through `f`, returning the hash of
    /// everything written. Nothing is recorded in the checksum store. On any
    /// error, including cancellation, the partial file is removed and the
    /// existing file (if any) is left untouched.
    pub fn write_with<F>(&self, reporter: &Reporter, f: F) -> Result<String>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<u64>,
    {
        write_atomic(&self.full_path(), reporter, f)
    }
}

/// Sibling path that `path` is written to before being renamed into place.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Stream new contents into `target` through `f`, returning the SHA-256 hash
/// of everything written. The data goes to [`partial_path`] first and is only
/// renamed onto `target` after it is flushed to disk. On any error, including
/// cancellation, the partial file is removed and `target` is left untouched.
pub fn write_atomic<F>(target: &Path, reporter: &Reporter, f: F) -> Result<String>
where
    F: FnOnce(&mut dyn Write) -> io::Result<u64>,
{
    let (partial, hash) = write_partial(target, reporter, f)?;
    rename_partial(&partial, target)?;

    Ok(hash)
}

/// First half of [`write_atomic`]: write and flush the partial file. Returns
/// its path and hash. `target` is not touched.
fn write_partial<F>(target: &Path, reporter: &Reporter, f: F) -> Result<(PathBuf, String)>
where
    F: FnOnce(&mut dyn Write) -> io::Result<u64>,
{
    let partial = partial_path(target);

    create_parent(target)?;

    let result = (|| {
        reporter.check_cancel()?;

        let file = File::create(&partial)?;
        let context = Context::new(&ring::digest::SHA256);
        let mut writer = HashingWriter::new(BufWriter::new(file), context);

        f(&mut writer)?;
        writer.flush()?;

        let (buf_writer, context) = writer.finish();
        let file = buf_writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        reporter.check_cancel()?;

        Ok(hex::encode(context.finish()))
    })();

    match result {
        Ok(hash) => Ok((partial, hash)),
        Err(e) => {
            // Best effort. The original error is more useful.
            let _ = remove_if_exists(&partial);
            Err(Error::Io("write file", target.to_owned(), e))
        }
    }
}

fn rename_partial(partial: &Path, target: &Path) -> Result<()> {
    if let Err(e) = fs::rename(partial, target) {
        let _ = remove_if_exists(partial);
        return Err(Error::Io("rename file", partial.to_owned(), e));
    }

    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    let parent = crate::util::parent_path(path);

    fs::create_dir_all(parent).map_err(|e| Error::Io("create directory", parent.to_owned(), e))
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Deleted {path:?}");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io("delete file", path.to_owned(), e)),
    }
}

/// Where the target app keeps the files the engine restores into.
#[derive(Clone, Debug)]
pub struct Target {
    /// Package name of the target app.
    pub package: String,
    /// Location of the installed OBB.
    pub obb: PathBuf,
    /// Location of the live save data.
    pub savedata: PathBuf,
}

/// Name of the fixed backup subdirectory under the managed root.
pub const BACKUP_DIR: &str = "backup";

/// One handle per well-known role, constructed once and held for the
/// lifetime of the process.
#[derive(Clone, Debug)]
pub struct Files {
    root: PathBuf,
    pub savedata: VerifiableFile,
    pub savedata_backup: VerifiableFile,
    pub savedata_prior: VerifiableFile,
    pub savedata_snapshot: VerifiableFile,
    pub apk_backup: VerifiableFile,
    pub signed_apk: VerifiableFile,
    pub obb_backup: VerifiableFile,
    pub installed_obb: VerifiableFile,
    pub scripts: VerifiableFile,
}

impl Files {
    pub fn new(root: &Path, target: &Target) -> Self {
        let backup = root.join(BACKUP_DIR);

        Self {
            root: root.to_owned(),
            savedata: VerifiableFile::from_path(&target.savedata, FileRole::SaveData),
            savedata_backup: VerifiableFile::new(&backup, "savedata", FileRole::SaveDataBackup),
            savedata_prior: VerifiableFile::new(
                &backup,
                "savedata.prior",
                FileRole::PriorSaveDataBackup,
            ),
            savedata_snapshot: VerifiableFile::new(
                root,
                "savedata.snapshot",
                FileRole::SaveDataSnapshot,
            ),
            apk_backup: VerifiableFile::new(&backup, "base.apk", FileRole::ApkBackup),
            signed_apk: VerifiableFile::new(root, "patched.apk", FileRole::SignedApk),
            obb_backup: VerifiableFile::new(&backup, "main.obb", FileRole::ObbBackup),
            installed_obb: VerifiableFile::from_path(&target.obb, FileRole::InstalledObb),
            scripts: VerifiableFile::new(root, "scripts.zip", FileRole::Scripts),
        }
    }

    /// The managed root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn manifest_backup_path(&self) -> PathBuf {
        self.root.join("manifest.json.bak")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.toml")
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::store::Store;

    fn setup() -> (tempfile::TempDir, Store, Reporter) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("state.toml")).unwrap();
        let reporter = Reporter::silent(Arc::new(AtomicBool::new(false)));

        (dir, store, reporter)
    }

    #[test]
    fn existence_is_not_trust() {
        let (dir, store, reporter) = setup();
        let file = VerifiableFile::new(dir.path(), "a.bin", FileRole::Scripts);
        fs::write(file.full_path(), b"data").unwrap();

        assert!(file.exists());
        assert!(!file.verify(&store, &reporter).unwrap());
    }

    #[test]
    fn verify_detects_modification() {
        let (dir, mut store, reporter) = setup();
        let file = VerifiableFile::new(dir.path(), "a.bin", FileRole::Scripts);
        fs::write(file.full_path(), b"data").unwrap();

        let hash = file.hash(&reporter).unwrap();
        file.record(&mut store, &hash).unwrap();
        assert!(file.verify(&store, &reporter).unwrap());

        fs::write(file.full_path(), b"tampered").unwrap();
        assert!(!file.verify(&store, &reporter).unwrap());
    }

    #[test]
    fn copy_records_destination_hash() {
        let (dir, mut store, reporter) = setup();
        let source = VerifiableFile::new(dir.path(), "a.bin", FileRole::InstalledObb);
        let target = VerifiableFile::new(dir.path().join("backup"), "b.bin", FileRole::ObbBackup);
        fs::write(source.full_path(), b"obb contents").unwrap();

        let hash = source.copy_to(&target, &mut store, &reporter).unwrap();

        assert_eq!(hash, checksum::hash_bytes(b"obb contents"));
        assert_eq!(store.get(FileRole::ObbBackup), Some(hash.as_str()));
        assert!(!store.contains(FileRole::InstalledObb));
        assert!(target.verify(&store, &reporter).unwrap());
        assert!(!target.partial_path().exists());
    }

    #[test]
    fn cancelled_copy_leaves_nothing_behind() {
        let (dir, mut store, _) = setup();
        let signal = Arc::new(AtomicBool::new(false));
        let reporter = Reporter::silent(signal.clone());
        let source = VerifiableFile::new(dir.path(), "a.bin", FileRole::InstalledObb);
        let target = VerifiableFile::new(dir.path(), "b.bin", FileRole::ObbBackup);
        fs::write(source.full_path(), vec![0u8; stream::CHUNK_SIZE * 4]).unwrap();

        signal.store(true, Ordering::SeqCst);
        let err = source.copy_to(&target, &mut store, &reporter).unwrap_err();

        assert!(err.is_cancelled());
        assert!(!target.exists());
        assert!(!target.partial_path().exists());
        assert!(!store.contains(FileRole::ObbBackup));
    }

    #[test]
    fn cancelled_copy_keeps_committed_destination() {
        let (dir, mut store, _) = setup();
        let signal = Arc::new(AtomicBool::new(false));
        let reporter = Reporter::silent(signal.clone());
        let source = VerifiableFile::new(dir.path(), "a.bin", FileRole::InstalledApk);
        let target = VerifiableFile::new(dir.path(), "b.bin", FileRole::ApkBackup);
        fs::write(source.full_path(), b"new apk").unwrap();
        fs::write(target.full_path(), b"old apk").unwrap();
        target
            .record(&mut store, &checksum::hash_bytes(b"old apk"))
            .unwrap();

        signal.store(true, Ordering::SeqCst);
        let err = source.copy_to(&target, &mut store, &reporter).unwrap_err();
        assert!(err.is_cancelled());

        signal.store(false, Ordering::SeqCst);
        assert!(target.verify(&store, &reporter).unwrap());
        assert_eq!(fs::read(target.full_path()).unwrap(), b"old apk");
        assert!(!target.partial_path().exists());
    }

    #[test]
    fn failed_write_keeps_existing_file() {
        let (dir, _, reporter) = setup();
        let file = VerifiableFile::new(dir.path(), "a.bin", FileRole::Scripts);
        fs::write(file.full_path(), b"old").unwrap();

        let err = file
            .write_with(&reporter, |w| {
                w.write_all(b"new but incomplete")?;
                Err(io::Error::other("connection reset"))
            })
            .unwrap_err();

        assert_matches!(err, Error::Io(..));
        assert_eq!(fs::read(file.full_path()).unwrap(), b"old");
        assert!(!file.partial_path().exists());
    }

    #[test]
    fn move_carries_checksum() {
        let (dir, mut store, reporter) = setup();
        let a = VerifiableFile::new(dir.path(), "a", FileRole::SaveDataBackup);
        let b = VerifiableFile::new(dir.path(), "b", FileRole::PriorSaveDataBackup);
        fs::write(a.full_path(), b"save").unwrap();
        a.record(&mut store, &a.hash(&reporter).unwrap()).unwrap();

        a.move_to(&b, &mut store).unwrap();

        assert!(!a.exists());
        assert!(!store.contains(FileRole::SaveDataBackup));
        assert!(b.verify(&store, &reporter).unwrap());
    }

    #[test]
    fn delete_clears_checksum() {
        let (dir, mut store, reporter) = setup();
        let file = VerifiableFile::new(dir.path(), "a", FileRole::SignedApk);
        fs::write(file.full_path(), b"apk").unwrap();
        file.record(&mut store, &file.hash(&reporter).unwrap()).unwrap();

        file.delete_if_exists(&mut store).unwrap();
        file.delete_if_exists(&mut store).unwrap();

        assert!(!file.exists());
        assert!(!store.contains(FileRole::SignedApk));
    }
}
