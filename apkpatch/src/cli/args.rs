// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, debug};

use crate::cli::{
    config::{self, Profile},
    key, manifest, pipeline,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
pub enum Command {
    Manifest(manifest::ManifestCli),
    Status(pipeline::StatusCli),
    Patch(pipeline::PatchCli),
    Unpatch(pipeline::UnpatchCli),
    Resume(pipeline::ResumeCli),
    AppUpdate(manifest::AppUpdateCli),
    Key(key::KeyCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to config file.
    #[arg(long, global = true, value_name = "FILE", default_value = "apkpatch.toml")]
    pub config: PathBuf,

    /// Profile to use when the config file has more than one.
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,
}

impl Cli {
    fn load_profile(&self) -> Result<Profile> {
        let config = config::load_config(&self.config)?;
        let (name, profile) = config.select(self.profile.as_deref())?;

        debug!("Using profile {name:?} from {:?}", self.config);

        Ok(profile.clone())
    }
}

pub fn init_logging(log_level: LogLevel) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::from(log_level))
        .without_time()
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &Arc<AtomicBool>) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level);
    logging_initialized.store(true, Ordering::SeqCst);

    match &cli.command {
        Command::Manifest(c) => manifest::manifest_main(c, &cli.load_profile()?, cancel_signal),
        Command::Status(c) => pipeline::status_main(c, &cli.load_profile()?),
        Command::Patch(c) => pipeline::patch_main(c, &cli.load_profile()?, cancel_signal),
        Command::Unpatch(c) => pipeline::unpatch_main(c, &cli.load_profile()?, cancel_signal),
        Command::Resume(c) => pipeline::resume_main(c, &cli.load_profile()?, cancel_signal),
        Command::AppUpdate(c) => {
            manifest::app_update_main(c, &cli.load_profile()?, cancel_signal)
        }
        Command::Key(c) => key::key_main(c),
    }
}
