// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Write},
    panic,
    sync::{Arc, atomic::AtomicBool},
    thread,
};

use anyhow::{Context as _, Result};
use clap::{Args, Parser};
use tracing::debug;

use crate::{
    cli::{
        config::Profile,
        install::CommandInstaller,
        key::PassphraseGroup,
        manifest::{fetch_manifest, retriever},
        status, warning,
    },
    crypto::PassphraseSource,
    device::LocalDevice,
    download::HttpDownloader,
    pipeline::{self, Context, Outcome},
    progress::{Event, Reporter},
    sign::JarSigner,
};

/// Prints pipeline events as they arrive.
#[derive(Default)]
struct EventPrinter {
    progress_shown: bool,
}

impl EventPrinter {
    fn end_progress(&mut self) {
        if self.progress_shown {
            eprintln!();
            self.progress_shown = false;
        }
    }

    fn print(&mut self, event: Event) {
        match event {
            Event::Step(message) => {
                self.end_progress();
                status!("{message}");
            }
            Event::Warning(message) => {
                self.end_progress();
                warning!("{message}");
            }
            Event::Progress {
                indeterminate: true,
                ..
            } => {}
            Event::Progress { percent, .. } => {
                eprint!("\r    {percent:>3}%");
                let _ = io::stderr().flush();
                self.progress_shown = true;
            }
        }
    }
}

/// Run `f` on a worker thread while its progress events are printed on this
/// one.
pub(crate) fn run_with_reporter<T: Send>(
    cancel_signal: &Arc<AtomicBool>,
    f: impl FnOnce(&Reporter) -> T + Send,
) -> T {
    let (reporter, events) = Reporter::channel(cancel_signal.clone());

    thread::scope(|s| {
        let handle = s.spawn(move || f(&reporter));

        let mut printer = EventPrinter::default();
        for event in events {
            printer.print(event);
        }
        printer.end_progress();

        match handle.join() {
            Ok(value) => value,
            Err(e) => panic::resume_unwind(e),
        }
    })
}

pub(crate) fn pipeline_error(e: pipeline::Error) -> anyhow::Error {
    if let pipeline::Error::Internal {
        report: Some(path), ..
    } = &e
    {
        warning!("Bug report written to {path:?}");
    }

    let kind = e.kind();
    anyhow::Error::new(e).context(format!("Run did not complete ({kind:?})"))
}

/// Run one pipeline operation behind the guarded boundary.
fn run_step<'a, T: Send>(
    ctx: &mut Context<'a>,
    cancel_signal: &Arc<AtomicBool>,
    f: impl FnOnce(&mut Context<'a>, &Reporter) -> pipeline::Result<T> + Send,
) -> Result<T> {
    let root = ctx.files().root().to_owned();

    run_with_reporter(cancel_signal, |reporter| {
        pipeline::run_guarded(&root, || f(ctx, reporter))
    })
    .map_err(pipeline_error)
}

/// Keep feeding installer verdicts back in until the run commits, or stop at
/// the first request when no installer commands are configured.
fn drive<'a>(
    ctx: &mut Context<'a>,
    profile: &Profile,
    mut outcome: Outcome,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let installer = CommandInstaller::new(&profile.uninstall_command, &profile.install_command);

    loop {
        let request = match outcome {
            Outcome::Committed => {
                status!("Completed");
                return Ok(());
            }
            Outcome::Suspended(r) => r,
        };

        let Some(installer) = &installer else {
            status!("Waiting for the installer to {request}");
            status!("Afterwards, run `apkpatch resume --success` or `apkpatch resume --failure`");
            return Ok(());
        };

        status!("Running installer to {request}");
        let success = installer.run(&request)?;

        outcome = run_step(ctx, cancel_signal, |ctx, r| ctx.resume(success, r))?;
    }
}

fn open_context<'a>(
    profile: &Profile,
    device: &'a LocalDevice,
    downloader: &'a HttpDownloader,
) -> Result<Context<'a>> {
    let ctx = Context::open(&profile.root, profile.target(), device, downloader)
        .with_context(|| format!("Failed to open managed root: {:?}", profile.root))?
        .with_min_free_space(profile.min_free_space);

    Ok(ctx)
}

pub fn status_main(_cli: &StatusCli, profile: &Profile) -> Result<()> {
    let device = LocalDevice::new(profile.installed_apk.clone());
    let downloader = HttpDownloader::new(profile.timeout());
    let ctx = open_context(profile, &device, &downloader)?;
    let store = ctx.store();

    println!("Package: {}", profile.package);
    println!("Managed root: {:?}", profile.root);
    println!("Patched: {}", store.is_patched());

    let versions = store.versions();
    if let Some(v) = versions.scripts {
        println!("Scripts version: {v}");
    }
    if let Some(v) = versions.obb {
        println!("OBB version: {v}");
    }

    match store.pending() {
        Some(p) => println!("Pending: {} at {}", p.pipeline, p.step),
        None => println!("Pending: none"),
    }

    match retriever(profile).load_local() {
        Ok(manifest) => {
            let updates = ctx.update_state(&manifest);
            println!("Cached manifest version: {}", manifest.version);
            println!("Scripts update available: {}", updates.scripts);
            println!("OBB update available: {}", updates.obb);
        }
        Err(e) => {
            debug!("No usable cached manifest: {e}");
            println!("Cached manifest: none");
        }
    }

    Ok(())
}

pub fn patch_main(
    cli: &PatchCli,
    profile: &Profile,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let device = LocalDevice::new(profile.installed_apk.clone());
    let downloader = HttpDownloader::new(profile.timeout());
    let mut ctx = open_context(profile, &device, &downloader)?;

    let key = profile
        .key
        .as_deref()
        .context("Profile has no signing key configured")?;
    let cert = profile
        .cert
        .as_deref()
        .context("Profile has no signing certificate configured")?;
    let source = PassphraseSource::new(
        key,
        cli.passphrase.pass_file.as_deref(),
        cli.passphrase.pass_env_var.as_deref(),
    );
    let signer = JarSigner::from_files(key, cert, &source)
        .with_context(|| format!("Failed to load signing key: {key:?}"))?;

    let manifest = fetch_manifest(profile, &downloader, cli.offline, cancel_signal)?;
    let process_savedata = !cli.no_savedata;

    let outcome = run_step(&mut ctx, cancel_signal, |ctx, r| {
        ctx.patch(&manifest, process_savedata, &signer, r)
    })?;

    drive(&mut ctx, profile, outcome, cancel_signal)
}

pub fn unpatch_main(
    cli: &UnpatchCli,
    profile: &Profile,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let device = LocalDevice::new(profile.installed_apk.clone());
    let downloader = HttpDownloader::new(profile.timeout());
    let mut ctx = open_context(profile, &device, &downloader)?;
    let process_savedata = !cli.no_savedata;

    let outcome = run_step(&mut ctx, cancel_signal, |ctx, r| {
        ctx.unpatch(process_savedata, r)
    })?;

    drive(&mut ctx, profile, outcome, cancel_signal)
}

pub fn resume_main(
    cli: &ResumeCli,
    profile: &Profile,
    cancel_signal: &Arc<AtomicBool>,
) -> Result<()> {
    let device = LocalDevice::new(profile.installed_apk.clone());
    let downloader = HttpDownloader::new(profile.timeout());
    let mut ctx = open_context(profile, &device, &downloader)?;
    let success = cli.result.success;

    let outcome = run_step(&mut ctx, cancel_signal, |ctx, r| ctx.resume(success, r))?;

    drive(&mut ctx, profile, outcome, cancel_signal)
}

/// Show the engine state for the selected profile.
#[derive(Debug, Parser)]
pub struct StatusCli {}

/// Patch the app with the latest scripts and OBB.
///
/// On a first patch, the app is uninstalled and the re-signed APK installed
/// in its place. Afterwards, only newer components are applied.
#[derive(Debug, Parser)]
pub struct PatchCli {
    /// Leave the save data alone.
    #[arg(long)]
    pub no_savedata: bool,

    /// Use the cached manifest instead of fetching a new one.
    #[arg(long)]
    pub offline: bool,

    #[command(flatten)]
    pub passphrase: PassphraseGroup,
}

/// Restore the original APK and OBB.
#[derive(Debug, Parser)]
pub struct UnpatchCli {
    /// Leave the save data alone.
    #[arg(long)]
    pub no_savedata: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct ResultGroup {
    /// The requested uninstall or install succeeded.
    #[arg(long)]
    pub success: bool,

    /// The requested uninstall or install failed.
    #[arg(long)]
    pub failure: bool,
}

/// Continue a run that is waiting for the installer.
#[derive(Debug, Parser)]
pub struct ResumeCli {
    #[command(flatten)]
    pub result: ResultGroup,
}
