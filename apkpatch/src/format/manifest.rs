// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! The remote version descriptor. Unknown JSON fields are ignored; every
//! consumed field is mandatory and must be non-zero or non-empty.

use std::io::Read;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse manifest")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid manifest")]
    Validation(#[from] ValidationError),
}

type Result<T> = std::result::Result<T, Error>;

/// The first field that failed validation, as a dotted JSON path.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Field {field} is {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: &'static str,
}

/// A downloadable component of the patch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub version: u64,
    pub url: String,
    /// Hex encoded SHA-256 digest.
    pub hash: String,
    pub size: u64,
}

/// A newer build of this tool.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppUpdate {
    pub version: u64,
    pub url: String,
    pub hash: String,
    pub size: u64,
    pub changelog: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub app_update: AppUpdate,
    pub scripts: Artifact,
    pub obb: Artifact,
}

fn check_version(field: &'static str, value: u64) -> std::result::Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError {
            field,
            reason: "zero",
        });
    }

    Ok(())
}

fn check_str(field: &'static str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError {
            field,
            reason: "empty",
        });
    }

    Ok(())
}

impl Artifact {
    fn validate(&self, prefix: &[&'static str; 4]) -> std::result::Result<(), ValidationError> {
        check_version(prefix[0], self.version)?;
        check_str(prefix[1], &self.url)?;
        check_str(prefix[2], &self.hash)?;
        check_version(prefix[3], self.size)
    }
}

impl Manifest {
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let manifest: Self = serde_json::from_reader(reader).map_err(Error::Parse)?;
        manifest.validate()?;

        Ok(manifest)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Self::from_reader(data)
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        check_version("version", self.version)?;

        check_version("app_update.version", self.app_update.version)?;
        check_str("app_update.url", &self.app_update.url)?;
        check_str("app_update.hash", &self.app_update.hash)?;
        check_version("app_update.size", self.app_update.size)?;
        check_str("app_update.changelog", &self.app_update.changelog)?;

        self.scripts.validate(&[
            "scripts.version",
            "scripts.url",
            "scripts.hash",
            "scripts.size",
        ])?;
        self.obb
            .validate(&["obb.version", "obb.url", "obb.hash", "obb.size"])
    }

    /// Whether the manifest advertises a newer build than `current`.
    pub fn app_update_available(&self, current: u64) -> bool {
        self.app_update.version > current
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;

    use super::*;

    pub(crate) const VALID: &str = r#"{
        "version": 3,
        "app_update": {
            "version": 5,
            "url": "https://example.com/apkpatch",
            "hash": "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
            "size": 1024,
            "changelog": "Bug fixes"
        },
        "scripts": {
            "version": 2,
            "url": "https://example.com/scripts.zip",
            "hash": "C3AB8FF13720E8AD9047DD39466B3C8974E592C2FA383D4A3960714CAEF0C4F2",
            "size": 6
        },
        "obb": {
            "version": 1,
            "url": "https://example.com/main.obb",
            "hash": "c3ab8ff13720e8ad9047dd39466b3c8974e592c2fa383d4a3960714caef0c4f2",
            "size": 6,
            "extra": "ignored"
        }
    }"#;

    #[test]
    fn parse_valid() {
        let manifest = Manifest::from_slice(VALID.as_bytes()).unwrap();

        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.scripts.version, 2);
        assert_eq!(manifest.obb.url, "https://example.com/main.obb");
        assert!(manifest.app_update_available(4));
        assert!(!manifest.app_update_available(5));
    }

    #[test]
    fn reject_zero_and_empty() {
        let mut manifest = Manifest::from_slice(VALID.as_bytes()).unwrap();
        manifest.obb.size = 0;
        assert_eq!(
            manifest.validate(),
            Err(ValidationError {
                field: "obb.size",
                reason: "zero",
            }),
        );

        let mut manifest = Manifest::from_slice(VALID.as_bytes()).unwrap();
        manifest.scripts.url = " ".into();
        assert_eq!(manifest.validate().unwrap_err().field, "scripts.url");

        let mut manifest = Manifest::from_slice(VALID.as_bytes()).unwrap();
        manifest.app_update.hash = "".into();
        assert_eq!(manifest.validate().unwrap_err().field, "app_update.hash");
    }

    #[test]
    fn hash_format_is_left_to_download_check() {
        let data = r#"{
            "version": 1,
            "app_update": {
                "version": 1,
                "url": "https://example.com/apkpatch",
                "hash": "abc",
                "size": 1,
                "changelog": "First"
            },
            "scripts": {"version": 2, "url": "https://example.com/s.zip", "hash": "abc", "size": 1},
            "obb": {"version": 1, "url": "https://example.com/m.obb", "hash": "def", "size": 1}
        }"#;

        let manifest = Manifest::from_slice(data.as_bytes()).unwrap();
        assert_eq!(manifest.scripts.hash, "abc");
        assert_eq!(manifest.obb.hash, "def");
    }

    #[test]
    fn reject_missing_field() {
        let data = VALID.replace("\"changelog\": \"Bug fixes\"", "\"notes\": \"\"");

        assert_matches!(Manifest::from_slice(data.as_bytes()), Err(Error::Parse(_)));
    }

    #[test]
    fn reject_garbage() {
        assert_matches!(Manifest::from_slice(b"<html>"), Err(Error::Parse(_)));
        assert_matches!(Manifest::from_slice(b""), Err(Error::Parse(_)));
    }
}
