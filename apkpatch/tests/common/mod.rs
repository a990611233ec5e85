// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs,
    io::{self, Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::Receiver,
    },
};

use tempfile::TempDir;
use zip::{ZipWriter, write::SimpleFileOptions};

use apkpatch::{
    checksum,
    device::{self, Device},
    download::{Downloader, Response, TransportError},
    file::Target,
    format::manifest::{AppUpdate, Artifact, Manifest},
    pipeline::Context,
    progress::{Event, Reporter},
    sign::{self, ApkSigner},
    stream::{self, ReadSeek, WriteSeek},
};

pub const PACKAGE: &str = "com.example.game";

pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (name, data) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap().into_inner()
}

/// Serves registered bodies from memory and records every request.
#[derive(Default)]
pub struct MemoryDownloader {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    /// Set after the first chunk of every body has been read.
    cancel_mid_body: Mutex<Option<Arc<AtomicBool>>>,
}

impl MemoryDownloader {
    pub fn serve(&self, url: &str, data: &[u8]) {
        self.bodies
            .lock()
            .unwrap()
            .insert(url.to_owned(), data.to_vec());
    }

    pub fn withdraw(&self, url: &str) {
        self.bodies.lock().unwrap().remove(url);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn cancel_mid_body(&self, signal: Option<Arc<AtomicBool>>) {
        *self.cancel_mid_body.lock().unwrap() = signal;
    }
}

/// Reads one small chunk, then raises the cancel signal.
struct CancellingReader {
    inner: Cursor<Vec<u8>>,
    signal: Arc<AtomicBool>,
}

impl Read for CancellingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = buf.len().min(4);
        let n = self.inner.read(&mut buf[..limit])?;
        self.signal.store(true, Ordering::SeqCst);
        Ok(n)
    }
}

impl Downloader for MemoryDownloader {
    fn open(&self, url: &str) -> Result<Response, TransportError> {
        self.requests.lock().unwrap().push(url.to_owned());

        let Some(data) = self.bodies.lock().unwrap().get(url).cloned() else {
            return Err(TransportError::Status {
                url: url.to_owned(),
                status: 404,
            });
        };
        let content_length = Some(data.len() as u64);

        let reader: Box<dyn Read + Send> = match self.cancel_mid_body.lock().unwrap().clone() {
            Some(signal) => Box::new(CancellingReader {
                inner: Cursor::new(data),
                signal,
            }),
            None => Box::new(Cursor::new(data)),
        };

        Ok(Response {
            reader,
            content_length,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query {
    /// The last precondition before a pipeline starts copying files.
    FreeSpace,
    /// Asked for right after the save data snapshot is taken.
    InstalledApk,
}

/// A device whose installed APK is a plain file.
pub struct FakeDevice {
    pub apk: PathBuf,
    pub free_space: AtomicU64,
    /// Raise the signal when the query is made.
    pub cancel_on: Mutex<Option<(Query, Arc<AtomicBool>)>>,
}

impl FakeDevice {
    fn trip(&self, query: Query) {
        if let Some((q, signal)) = &*self.cancel_on.lock().unwrap()
            && *q == query
        {
            signal.store(true, Ordering::SeqCst);
        }
    }
}

impl Device for FakeDevice {
    fn is_installed(&self, _package: &str) -> Result<bool, device::Error> {
        Ok(self.apk.exists())
    }

    fn installed_apk(&self, package: &str) -> Result<PathBuf, device::Error> {
        self.trip(Query::InstalledApk);

        if !self.apk.exists() {
            return Err(device::Error::NotInstalled(package.to_owned()));
        }

        Ok(self.apk.clone())
    }

    fn free_space(&self, _path: &Path) -> Result<u64, device::Error> {
        self.trip(Query::FreeSpace);

        Ok(self.free_space.load(Ordering::SeqCst))
    }
}

/// Copies the unsigned APK through unchanged.
pub struct PassthroughSigner;

impl ApkSigner for PassthroughSigner {
    fn sign(
        &self,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        cancel_signal: &AtomicBool,
    ) -> Result<(), sign::Error> {
        stream::copy(input, output, cancel_signal)
            .map_err(|e| sign::Error::WriteEntry("passthrough", e))?;
        Ok(())
    }
}

/// Raises the cancel signal as soon as signing starts.
pub struct CancellingSigner;

impl ApkSigner for CancellingSigner {
    fn sign(
        &self,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        cancel_signal: &AtomicBool,
    ) -> Result<(), sign::Error> {
        cancel_signal.store(true, Ordering::SeqCst);
        PassthroughSigner.sign(input, output, cancel_signal)
    }
}

pub const ORIGINAL_OBB: &[u8] = b"original obb contents";
pub const ORIGINAL_SAVE: &[u8] = b"original save data";

/// An installed app, a managed root and collaborators that only touch a
/// temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub target: Target,
    pub device: FakeDevice,
    pub downloader: MemoryDownloader,
    pub cancel_signal: Arc<AtomicBool>,
    pub original_apk: Vec<u8>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        fs::create_dir_all(&app).unwrap();

        let original_apk = build_zip(&[
            ("AndroidManifest.xml", b"manifest"),
            ("classes.dex", b"dex"),
            ("assets/script/main.lua", b"original main"),
            ("META-INF/CERT.RSA", b"vendor signature"),
        ]);

        let target = Target {
            package: PACKAGE.to_owned(),
            obb: app.join("main.obb"),
            savedata: app.join("save.dat"),
        };
        let apk = app.join("base.apk");

        fs::write(&apk, &original_apk).unwrap();
        fs::write(&target.obb, ORIGINAL_OBB).unwrap();
        fs::write(&target.savedata, ORIGINAL_SAVE).unwrap();

        Self {
            root: dir.path().join("root"),
            dir,
            target,
            device: FakeDevice {
                apk,
                free_space: AtomicU64::new(u64::MAX),
                cancel_on: Mutex::new(None),
            },
            downloader: MemoryDownloader::default(),
            cancel_signal: Arc::new(AtomicBool::new(false)),
            original_apk,
        }
    }

    pub fn context(&self) -> Context<'_> {
        Context::open(&self.root, self.target.clone(), &self.device, &self.downloader).unwrap()
    }

    /// Raise the cancel signal as soon as the pipeline makes `query`.
    pub fn cancel_on(&self, query: Query) {
        *self.device.cancel_on.lock().unwrap() = Some((query, self.cancel_signal.clone()));
    }

    pub fn reporter(&self) -> (Reporter, Receiver<Event>) {
        Reporter::channel(self.cancel_signal.clone())
    }

    /// Register a scripts archive with the downloader and describe it.
    pub fn scripts(&self, version: u64, files: &[(&str, &[u8])]) -> Artifact {
        let data = build_zip(files);
        let url = format!("https://example.com/scripts-v{version}.zip");
        self.downloader.serve(&url, &data);

        Artifact {
            version,
            url,
            hash: checksum::hash_bytes(&data),
            size: data.len() as u64,
        }
    }

    /// Register an OBB with the downloader and describe it.
    pub fn obb(&self, version: u64, data: &[u8]) -> Artifact {
        let url = format!("https://example.com/main-v{version}.obb");
        self.downloader.serve(&url, data);

        Artifact {
            version,
            url,
            hash: checksum::hash_bytes(data),
            size: data.len() as u64,
        }
    }

    pub fn manifest(&self, scripts: Artifact, obb: Artifact) -> Manifest {
        Manifest {
            version: 1,
            app_update: AppUpdate {
                version: 1,
                url: "https://example.com/app.apk".to_owned(),
                hash: checksum::hash_bytes(b"app"),
                size: 3,
                changelog: "Initial release".to_owned(),
            },
            scripts,
            obb,
        }
    }

    /// What the OS does on uninstall: the APK, the OBB and the app's data go
    /// away.
    pub fn uninstall(&self) {
        fs::remove_file(&self.device.apk).unwrap();
        let _ = fs::remove_file(&self.target.obb);
        let _ = fs::remove_file(&self.target.savedata);
    }

    pub fn install(&self, apk: &Path) {
        fs::copy(apk, &self.device.apk).unwrap();
    }

    /// Every file under the managed root, relative to it.
    pub fn managed_files(&self) -> Vec<String> {
        fn walk(dir: &Path, base: &Path, out: &mut Vec<String>) {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };

            for entry in entries {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, base, out);
                } else {
                    let relative = path.strip_prefix(base).unwrap();
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        let mut out = vec![];
        walk(&self.root, &self.root, &mut out);
        out.sort();
        out
    }
}

pub fn drain(events: &Receiver<Event>) -> Vec<Event> {
    events.try_iter().collect()
}

pub fn steps(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Step(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

pub fn warnings(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Warning(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}
