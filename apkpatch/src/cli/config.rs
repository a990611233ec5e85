// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::{file::Target, pipeline::MIN_FREE_SPACE, util};

/// One deployment of the target app, such as a regional build with its own
/// package name and manifest endpoint.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub manifest_url: String,
    pub package: String,
    /// Managed root holding backups, downloads and engine state.
    pub root: PathBuf,
    /// Where the installed APK can be read from.
    pub installed_apk: PathBuf,
    pub obb: PathBuf,
    pub savedata: PathBuf,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,
    /// HTTP timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Command that uninstalls `{package}`. Without it, the handoff is left
    /// to the user.
    #[serde(default)]
    pub uninstall_command: Vec<String>,
    /// Command that installs `{apk}`.
    #[serde(default)]
    pub install_command: Vec<String>,
}

fn default_min_free_space() -> u64 {
    MIN_FREE_SPACE
}

fn default_timeout() -> u64 {
    30
}

impl Profile {
    pub fn target(&self) -> Target {
        Target {
            package: self.package.clone(),
            obb: self.obb.clone(),
            savedata: self.savedata.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Make every relative path relative to `base` instead of the current
    /// directory.
    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            Some(&mut self.root),
            Some(&mut self.installed_apk),
            Some(&mut self.obb),
            Some(&mut self.savedata),
            self.key.as_mut(),
            self.cert.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub profile: BTreeMap<String, Profile>,
}

impl Config {
    /// Pick the profile named `name`. Without a name, a config with a single
    /// profile selects it implicitly.
    pub fn select(&self, name: Option<&str>) -> Result<(&str, &Profile)> {
        if let Some(n) = name {
            return self
                .profile
                .get_key_value(n)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| anyhow!("Profile not found: {n:?}"));
        }

        let mut iter = self.profile.iter();

        match (iter.next(), iter.next()) {
            (Some((k, v)), None) => Ok((k.as_str(), v)),
            (None, _) => bail!("No profiles configured"),
            (Some(_), Some(_)) => {
                let names = self.profile.keys().cloned().collect::<Vec<_>>();
                bail!("Multiple profiles configured; pick one of: {names:?}")
            }
        }
    }
}

pub fn parse_config(contents: &str, base: &Path) -> Result<Config> {
    let mut config: Config = toml_edit::de::from_str(contents)?;

    for profile in config.profile.values_mut() {
        profile.resolve_paths(base);
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read config: {path:?}"))?;

    parse_config(&contents, util::parent_path(path))
        .with_context(|| format!("Failed to parse config: {path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        [profile.global]
        manifest_url = "https://example.com/global/manifest.json"
        package = "com.example.game"
        root = "state/global"
        installed_apk = "/data/app/com.example.game/base.apk"
        obb = "/sdcard/Android/obb/com.example.game/main.obb"
        savedata = "save/global.dat"
        install_command = ["adb", "install", "{apk}"]

        [profile.jp]
        manifest_url = "https://example.com/jp/manifest.json"
        package = "jp.example.game"
        root = "state/jp"
        installed_apk = "jp.apk"
        obb = "jp.obb"
        savedata = "jp.dat"
        min_free_space = 1024
        timeout = 5
    "#;

    #[test]
    fn profiles_and_defaults() {
        let config = parse_config(CONFIG, Path::new("/etc/apkpatch")).unwrap();

        let (name, global) = config.select(Some("global")).unwrap();
        assert_eq!(name, "global");
        assert_eq!(global.root, Path::new("/etc/apkpatch/state/global"));
        assert_eq!(
            global.installed_apk,
            Path::new("/data/app/com.example.game/base.apk"),
        );
        assert_eq!(global.min_free_space, MIN_FREE_SPACE);
        assert_eq!(global.timeout(), Duration::from_secs(30));
        assert!(global.uninstall_command.is_empty());
        assert_eq!(global.install_command, ["adb", "install", "{apk}"]);

        let (_, jp) = config.select(Some("jp")).unwrap();
        assert_eq!(jp.min_free_space, 1024);
        assert_eq!(jp.target().package, "jp.example.game");
    }

    #[test]
    fn implicit_selection() {
        let config = parse_config(CONFIG, Path::new(".")).unwrap();
        assert!(config.select(None).is_err());
        assert!(config.select(Some("kr")).is_err());

        let single = CONFIG.split("[profile.jp]").next().unwrap();
        let config = parse_config(single, Path::new(".")).unwrap();
        assert_eq!(config.select(None).unwrap().0, "global");
    }

    #[test]
    fn unknown_fields_rejected() {
        let contents = format!("{CONFIG}\nbogus = 1\n");
        assert!(parse_config(&contents, Path::new(".")).is_err());
    }
}
