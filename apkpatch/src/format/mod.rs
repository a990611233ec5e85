// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

pub mod jar;
pub mod manifest;
pub mod zip;
