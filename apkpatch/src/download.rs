// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Streaming HTTP downloads. The engine only ever sees the [`Downloader`]
//! trait; [`HttpDownloader`] is the real implementation.

use std::{
    cell::Cell,
    io::{self, Read},
    path::Path,
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    file::{self, VerifiableFile},
    progress::Reporter,
    stream,
    util::NumBytes,
};

/// Failure to obtain the bytes of a remote resource. An HTTP error status is
/// reported separately from everything else.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Server returned HTTP {status}: {url}")]
    Status { url: String, status: u16 },
    #[error("Failed to fetch: {url}")]
    Io {
        url: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub fn url(&self) -> &str {
        match self {
            Self::Status { url, .. } | Self::Io { url, .. } => url,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to save download")]
    File(#[from] file::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Transport(_) => false,
            Self::File(e) => e.is_cancelled(),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// An open response body.
pub struct Response {
    pub reader: Box<dyn Read + Send>,
    /// Only used as a progress denominator. Never trusted for integrity.
    pub content_length: Option<u64>,
}

pub trait Downloader: Send + Sync {
    /// Issue a GET request for `url`. Anything but a successful response is a
    /// [`TransportError`].
    fn open(&self, url: &str) -> std::result::Result<Response, TransportError>;
}

/// [`Downloader`] backed by a blocking [`ureq::Agent`].
pub struct HttpDownloader {
    agent: ureq::Agent,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .user_agent(concat!("apkpatch/", env!("CARGO_PKG_VERSION")))
            .build();

        Self { agent }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Downloader for HttpDownloader {
    fn open(&self, url: &str) -> std::result::Result<Response, TransportError> {
        debug!("GET {url}");

        let response = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::Status(status, _)) => {
                return Err(TransportError::Status {
                    url: url.to_owned(),
                    status,
                });
            }
            Err(ureq::Error::Transport(t)) => {
                return Err(TransportError::Io {
                    url: url.to_owned(),
                    source: io::Error::other(t),
                });
            }
        };

        if response.status() != 200 {
            return Err(TransportError::Status {
                url: url.to_owned(),
                status: response.status(),
            });
        }

        let content_length = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());

        Ok(Response {
            reader: Box::new(response.into_reader()),
            content_length,
        })
    }
}

/// Marks body read failures so they can be told apart from local write
/// failures after the copy loop returns.
struct TransportReader<'a, R> {
    inner: R,
    failed: &'a Cell<bool>,
}

impl<R: Read> Read for TransportReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != io::ErrorKind::Interrupted {
                self.failed.set(true);
            }
        })
    }
}

/// Download `url` to `path`, returning the SHA-256 hash of the received bytes.
/// The data is streamed into a `.part` file that only replaces `path` once
/// the body is complete. On failure or cancellation nothing is left behind.
pub fn download_to_path(
    downloader: &dyn Downloader,
    url: &str,
    path: &Path,
    reporter: &Reporter,
) -> Result<String> {
    reporter
        .check_cancel()
        .map_err(|e| file::Error::Io("download file", path.to_owned(), e))?;

    let response = downloader.open(url)?;
    let total = response.content_length;

    debug!(
        "Downloading {url} -> {path:?} ({:?})",
        total.map(NumBytes),
    );

    let failed = Cell::new(false);
    let reader = TransportReader {
        inner: response.reader,
        failed: &failed,
    };

    let result = file::write_atomic(path, reporter, |writer| {
        let mut done = 0;
        stream::copy_inspect(
            reader,
            writer,
            |buf| {
                done += buf.len() as u64;
                reporter.progress(done, total);
            },
            reporter.cancel_signal(),
        )
    });

    match result {
        Ok(hash) => Ok(hash),
        Err(file::Error::Io(_, _, e)) if failed.get() => Err(TransportError::Io {
            url: url.to_owned(),
            source: e,
        }
        .into()),
        Err(e) => Err(e.into()),
    }
}

/// Download `url` into a tracked file. The checksum store is not touched; the
/// caller decides whether the returned hash is acceptable.
pub fn download_to(
    downloader: &dyn Downloader,
    url: &str,
    file: &VerifiableFile,
    reporter: &Reporter,
) -> Result<String> {
    download_to_path(downloader, url, &file.full_path(), reporter)
}
