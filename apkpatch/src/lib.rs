// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Since apkpatch is primarily an application and not a library, the semver
//! versioning covers the CLI only. All Rust APIs can change at any time, even
//! in patch releases.
//!
//! The library side is the patch/unpatch engine: everything under
//! [`pipeline`] only touches the device, the network and the signer through
//! the [`device::Device`], [`download::Downloader`] and [`sign::ApkSigner`]
//! traits, so the CLI and the tests can plug in their own collaborators.

pub mod checksum;
pub mod cli;
pub mod crypto;
pub mod device;
pub mod download;
pub mod file;
pub mod format;
pub mod manifest;
pub mod patch;
pub mod pipeline;
pub mod progress;
pub mod sign;
pub mod store;
pub mod stream;
pub mod util;
