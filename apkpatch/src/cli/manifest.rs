// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

use anyhow::{Context, Result, bail};
use clap::Parser;

use crate::{
    checksum,
    cli::{
        config::Profile,
        pipeline::{pipeline_error, run_with_reporter},
        status, warning,
    },
    download::{self, Downloader, HttpDownloader},
    file::{self, Files},
    format::manifest::Manifest,
    manifest::ManifestRetriever,
    pipeline,
};

pub(crate) fn retriever(profile: &Profile) -> ManifestRetriever {
    let files = Files::new(&profile.root, &profile.target());

    ManifestRetriever::new(
        profile.manifest_url.clone(),
        files.manifest_path(),
        files.manifest_backup_path(),
    )
}

/// Fetch the manifest for `profile`, or read the cached copy when `offline`.
pub(crate) fn fetch_manifest(
    profile: &Profile,
    downloader: &dyn Downloader,
    offline: bool,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<Manifest> {
    let mut retriever = retriever(profile);

    if offline {
        return retriever.load_local().context("Failed to load cached manifest");
    }

    let url = retriever.url().to_owned();
    let retrieved = run_with_reporter(cancel_signal, |reporter| {
        pipeline::run_guarded(&profile.root, || {
            Ok(retriever.retrieve(downloader, reporter)?)
        })
    })
    .map_err(pipeline_error)
    .with_context(|| format!("Failed to retrieve manifest: {url}"))?;

    Ok(retrieved.manifest)
}

pub fn manifest_main(
    cli: &ManifestCli,
    profile: &Profile,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let downloader = HttpDownloader::new(profile.timeout());
    let manifest = fetch_manifest(profile, &downloader, cli.offline, cancel_signal)?;

    println!("Manifest version: {}", manifest.version);
    println!(
        "Scripts: version {}, {} bytes, {}",
        manifest.scripts.version, manifest.scripts.size, manifest.scripts.url,
    );
    println!(
        "OBB: version {}, {} bytes, {}",
        manifest.obb.version, manifest.obb.size, manifest.obb.url,
    );
    println!(
        "App update: version {}: {}",
        manifest.app_update.version, manifest.app_update.changelog,
    );

    Ok(())
}

pub fn app_update_main(
    cli: &AppUpdateCli,
    profile: &Profile,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let downloader = HttpDownloader::new(profile.timeout());
    let manifest = fetch_manifest(profile, &downloader, false, cancel_signal)?;
    let update = &manifest.app_update;

    if let Some(current) = cli.current_version
        && !manifest.app_update_available(current)
    {
        status!("Already up to date: version {current}");
        return Ok(());
    }

    status!("App update version {}: {}", update.version, update.changelog);

    let hash = run_with_reporter(cancel_signal, |reporter| {
        download::download_to_path(&downloader, &update.url, &cli.output, reporter)
    })
    .with_context(|| format!("Failed to download app update: {}", update.url))?;

    if !checksum::hashes_equal(&hash, &update.hash) {
        file::remove_if_exists(&cli.output)
            .with_context(|| format!("Failed to delete bad download: {:?}", cli.output))?;
        warning!("Expected {}, got {hash}", update.hash);
        bail!("App update hash mismatch: {}", update.url);
    }

    status!("Saved app update: {:?}", cli.output);

    Ok(())
}

/// Fetch the manifest and print what it offers.
///
/// If the fetched manifest is unusable, the previously cached copy is kept.
#[derive(Debug, Parser)]
pub struct ManifestCli {
    /// Print the cached manifest without fetching a new one.
    #[arg(long)]
    pub offline: bool,
}

/// Download the app update advertised by the manifest.
#[derive(Debug, Parser)]
pub struct AppUpdateCli {
    /// Path to output file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub output: PathBuf,

    /// Only download if the advertised version is newer than this.
    #[arg(long, value_name = "VERSION")]
    pub current_version: Option<u64>,
}
