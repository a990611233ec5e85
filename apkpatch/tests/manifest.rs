// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::{fs, path::PathBuf};

use assert_matches::assert_matches;

use apkpatch::{
    download::TransportError,
    format::manifest::Manifest,
    manifest::{Error, FetchError, ManifestRetriever, RetrievalState},
};

use common::{Fixture, drain, warnings};

const URL: &str = "https://example.com/manifest.json";

struct Paths {
    primary: PathBuf,
    backup: PathBuf,
}

fn retriever(fx: &Fixture) -> (ManifestRetriever, Paths) {
    fs::create_dir_all(&fx.root).unwrap();

    let paths = Paths {
        primary: fx.root.join("manifest.json"),
        backup: fx.root.join("manifest.json.bak"),
    };
    let r = ManifestRetriever::new(URL, paths.primary.clone(), paths.backup.clone());

    (r, paths)
}

fn sample(fx: &Fixture, version: u64) -> Manifest {
    let scripts = fx.scripts(1, &[("scripts/main.lua", b"main")]);
    let obb = fx.obb(1, b"obb");
    let mut manifest = fx.manifest(scripts, obb);
    manifest.version = version;
    manifest
}

#[test]
fn fresh_manifest_is_loaded() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, events) = fx.reporter();

    let manifest = sample(&fx, 2);
    fx.downloader
        .serve(URL, &serde_json::to_vec(&manifest).unwrap());

    let retrieved = r.retrieve(&fx.downloader, &reporter).unwrap();

    assert_eq!(r.state(), RetrievalState::Loaded);
    assert_eq!(retrieved.manifest, manifest);
    assert!(retrieved.fallback_reason.is_none());
    assert!(warnings(&drain(&events)).is_empty());

    assert_eq!(r.load_local().unwrap(), manifest);
    assert!(!paths.backup.exists());
}

#[test]
fn corrupt_download_falls_back_to_previous() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, events) = fx.reporter();

    let previous = sample(&fx, 1);
    fs::write(&paths.primary, serde_json::to_vec(&previous).unwrap()).unwrap();
    fx.downloader.serve(URL, b"{\"version\": 2, \"scripts\": ");

    let retrieved = r.retrieve(&fx.downloader, &reporter).unwrap();

    assert_eq!(r.state(), RetrievalState::Fallback);
    assert_eq!(retrieved.manifest, previous);
    assert_matches!(retrieved.fallback_reason, Some(FetchError::Invalid(_)));
    assert_eq!(warnings(&drain(&events)).len(), 1);

    // The previous copy is back in place for the next run.
    assert_eq!(r.load_local().unwrap(), previous);
    assert!(!paths.backup.exists());
}

#[test]
fn semantically_invalid_download_falls_back() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, _events) = fx.reporter();

    let previous = sample(&fx, 1);
    fs::write(&paths.primary, serde_json::to_vec(&previous).unwrap()).unwrap();

    let mut fresh = sample(&fx, 2);
    fresh.scripts.hash = String::new();
    fx.downloader.serve(URL, &serde_json::to_vec(&fresh).unwrap());

    let retrieved = r.retrieve(&fx.downloader, &reporter).unwrap();

    assert_eq!(r.state(), RetrievalState::Fallback);
    assert_eq!(retrieved.manifest, previous);
}

#[test]
fn unreachable_server_falls_back() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, _events) = fx.reporter();

    let previous = sample(&fx, 1);
    fs::write(&paths.primary, serde_json::to_vec(&previous).unwrap()).unwrap();

    let retrieved = r.retrieve(&fx.downloader, &reporter).unwrap();

    assert_eq!(r.state(), RetrievalState::Fallback);
    assert_matches!(
        retrieved.fallback_reason,
        Some(FetchError::Transport(TransportError::Status { status: 404, .. }))
    );
}

#[test]
fn both_copies_corrupt_fails() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, _events) = fx.reporter();

    fs::write(&paths.primary, b"garbage").unwrap();
    fx.downloader.serve(URL, b"more garbage");

    assert_matches!(
        r.retrieve(&fx.downloader, &reporter),
        Err(Error::Failed(FetchError::Invalid(_)))
    );
    assert_eq!(r.state(), RetrievalState::Failed);

    assert!(!paths.primary.exists());
    assert!(!paths.backup.exists());
    assert_matches!(r.load_local(), Err(Error::NoLocal(_)));
}

#[test]
fn no_previous_copy_fails() {
    let fx = Fixture::new();
    let (mut r, paths) = retriever(&fx);
    let (reporter, _events) = fx.reporter();

    assert_matches!(
        r.retrieve(&fx.downloader, &reporter),
        Err(Error::Failed(FetchError::Transport(_)))
    );
    assert_eq!(r.state(), RetrievalState::Failed);
    assert!(!paths.primary.exists());
}
