// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::pipeline::Request;

/// Carries out installer requests by running user-configured commands.
/// `{package}` and `{apk}` in the arguments are replaced with the request's
/// values.
#[derive(Clone, Debug)]
pub struct CommandInstaller {
    uninstall: Vec<String>,
    install: Vec<String>,
}

impl CommandInstaller {
    /// Returns [`None`] unless both commands are configured.
    pub fn new(uninstall: &[String], install: &[String]) -> Option<Self> {
        if uninstall.is_empty() || install.is_empty() {
            return None;
        }

        Some(Self {
            uninstall: uninstall.to_vec(),
            install: install.to_vec(),
        })
    }

    fn command_line(&self, request: &Request) -> Vec<String> {
        let (template, placeholder, value) = match request {
            Request::Uninstall { package } => (&self.uninstall, "{package}", package.clone()),
            Request::Install { apk } => {
                (&self.install, "{apk}", apk.to_string_lossy().into_owned())
            }
        };

        template
            .iter()
            .map(|arg| arg.replace(placeholder, &value))
            .collect()
    }

    /// Run the command for `request`. Returns whether it succeeded. Failing
    /// to spawn the command at all is an error.
    pub fn run(&self, request: &Request) -> Result<bool> {
        let args = self.command_line(request);
        let Some((program, rest)) = args.split_first() else {
            bail!("Empty installer command");
        };

        debug!("Running installer: {args:?}");

        let status = Command::new(program)
            .args(rest)
            .status()
            .with_context(|| format!("Failed to run installer: {program:?}"))?;

        if !status.success() {
            warn!("Installer exited with {status}: {args:?}");
        }

        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn requires_both_commands() {
        assert!(CommandInstaller::new(&[], &strings(&["true"])).is_none());
        assert!(CommandInstaller::new(&strings(&["true"]), &[]).is_none());
    }

    #[test]
    fn placeholders_are_substituted() {
        let installer = CommandInstaller::new(
            &strings(&["adb", "uninstall", "{package}"]),
            &strings(&["adb", "install", "-r", "{apk}"]),
        )
        .unwrap();

        assert_eq!(
            installer.command_line(&Request::Uninstall {
                package: "com.example".into(),
            }),
            ["adb", "uninstall", "com.example"],
        );
        assert_eq!(
            installer.command_line(&Request::Install {
                apk: PathBuf::from("/tmp/patched.apk"),
            }),
            ["adb", "install", "-r", "/tmp/patched.apk"],
        );
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_the_verdict() {
        let installer =
            CommandInstaller::new(&strings(&["true"]), &strings(&["false"])).unwrap();

        assert!(
            installer
                .run(&Request::Uninstall {
                    package: "com.example".into(),
                })
                .unwrap()
        );
        assert!(
            !installer
                .run(&Request::Install {
                    apk: PathBuf::from("x.apk"),
                })
                .unwrap()
        );
    }
}
