// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    io::{self, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use ring::digest::Context;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};
use x509_cert::{Certificate, der::Encode};
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError};

use crate::{
    crypto::{self, PassphraseSource},
    format::{jar, zip::file_options},
    stream::{self, HashingReader, ReadSeek, WriteSeek},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read unsigned APK")]
    Read(#[source] ZipError),
    #[error("Failed to write signed APK")]
    Write(#[source] ZipError),
    #[error("Failed to digest entry: {0:?}")]
    Digest(String, #[source] io::Error),
    #[error("Failed to write signature file: {0:?}")]
    WriteEntry(&'static str, #[source] io::Error),
    #[error("Failed to create signature")]
    Crypto(#[from] crypto::Error),
    #[error("Failed to encode signature block")]
    Encode(#[source] x509_cert::der::Error),
    #[error("Private key does not match certificate")]
    KeyMismatch,
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Read(ZipError::Io(e)) | Self::Write(ZipError::Io(e)) => {
                stream::is_cancelled(e)
            }
            Self::Digest(_, e) | Self::WriteEntry(_, e) => stream::is_cancelled(e),
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Turns an unsigned APK into a signed one. Implementations must be
/// deterministic: the same input must always produce the same output.
pub trait ApkSigner: Send + Sync {
    fn sign(
        &self,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        cancel_signal: &AtomicBool,
    ) -> Result<()>;
}

/// APK signature scheme v1 (JAR signing) with SHA-256 digests.
pub struct JarSigner {
    key: RsaPrivateKey,
    cert: Certificate,
}

impl JarSigner {
    pub fn new(key: RsaPrivateKey, cert: Certificate) -> Result<Self> {
        if !crypto::cert_matches_key(&cert, &key)? {
            return Err(Error::KeyMismatch);
        }

        Ok(Self { key, cert })
    }

    pub fn from_files(key: &Path, cert: &Path, source: &PassphraseSource) -> Result<Self> {
        let key = crypto::read_pem_key_file(key, source)?;
        let cert = crypto::read_pem_cert_file(cert)?;

        Self::new(key, cert)
    }

    fn signature_block(&self, signature_file: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(signature_file);
        let content_info = crypto::cms_sign_external(&self.key, &self.cert, &digest)?;

        content_info.to_der().map_err(Error::Encode)
    }
}

impl ApkSigner for JarSigner {
    fn sign(
        &self,
        input: &mut dyn ReadSeek,
        output: &mut dyn WriteSeek,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let mut archive = ZipArchive::new(input).map_err(Error::Read)?;
        let mut digests = BTreeMap::new();
        let mut copied = vec![];

        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(Error::Read)?;
            let name = entry.name().to_owned();

            if jar::is_signature_entry(&name) {
                trace!("Dropping existing signature entry: {name:?}");
                continue;
            }

            copied.push(index);

            if entry.is_dir() {
                continue;
            }

            let context = Context::new(&ring::digest::SHA256);
            let mut reader = HashingReader::new(entry, context);
            stream::copy(&mut reader, io::sink(), cancel_signal)
                .map_err(|e| Error::Digest(name.clone(), e))?;

            let (_, context) = reader.finish();
            digests.insert(name, context.finish().as_ref().to_vec());
        }

        debug!("Signing {} entries", digests.len());

        let files = jar::build(&digests, concat!("apkpatch ", env!("CARGO_PKG_VERSION")));
        let block = self.signature_block(&files.signature_file)?;

        let mut writer = ZipWriter::new(output);

        for (name, data) in [
            (jar::MANIFEST_NAME, &files.manifest),
            (jar::SIGNATURE_FILE_NAME, &files.signature_file),
            (jar::SIGNATURE_BLOCK_NAME, &block),
        ] {
            writer
                .start_file(name, file_options(CompressionMethod::Deflated))
                .map_err(Error::Write)?;
            writer
                .write_all(data)
                .map_err(|e| Error::WriteEntry(name, e))?;
        }

        for index in copied {
            stream::check_cancel(cancel_signal).map_err(|e| Error::Write(ZipError::Io(e)))?;

            let entry = archive.by_index_raw(index).map_err(Error::Read)?;
            writer.raw_copy_file(entry).map_err(Error::Write)?;
        }

        writer.finish().map_err(Error::Write)?;

        Ok(())
    }
}
