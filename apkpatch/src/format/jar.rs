// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Text files of a JAR (APK v1) signature: `META-INF/MANIFEST.MF` and the
//! signature file that covers it.

use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

/// Maximum bytes per line, excluding the CRLF terminator.
pub const MAX_LINE_LENGTH: usize = 70;

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";
pub const SIGNATURE_FILE_NAME: &str = "META-INF/CERT.SF";
pub const SIGNATURE_BLOCK_NAME: &str = "META-INF/CERT.RSA";

const DIGEST_ATTRIBUTE: &str = "SHA-256-Digest";

/// Write a `name: value` header, wrapping at [`MAX_LINE_LENGTH`] bytes.
/// Continuation lines start with a single space.
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let (first, mut rest) = line.as_bytes().split_at(line.len().min(MAX_LINE_LENGTH));

    out.extend_from_slice(first);
    out.extend_from_slice(b"\r\n");

    while !rest.is_empty() {
        let (chunk, remaining) = rest.split_at(rest.len().min(MAX_LINE_LENGTH - 1));
        out.push(b' ');
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
        rest = remaining;
    }
}

fn encode_digest(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// The two text files of a JAR signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureFiles {
    pub manifest: Vec<u8>,
    pub signature_file: Vec<u8>,
}

/// Build the manifest and signature file for the given entry name to SHA-256
/// digest mapping. The output only depends on the inputs.
pub fn build(digests: &BTreeMap<String, Vec<u8>>, created_by: &str) -> SignatureFiles {
    let mut manifest = vec![];
    write_attribute(&mut manifest, "Manifest-Version", "1.0");
    write_attribute(&mut manifest, "Created-By", created_by);
    manifest.extend_from_slice(b"\r\n");

    let main_attributes_digest = encode_digest(&manifest);
    let mut section_digests = vec![];

    for (name, digest) in digests {
        let mut section = vec![];
        write_attribute(&mut section, "Name", name);
        write_attribute(&mut section, DIGEST_ATTRIBUTE, &STANDARD.encode(digest));
        section.extend_from_slice(b"\r\n");

        section_digests.push((name, encode_digest(&section)));
        manifest.extend_from_slice(&section);
    }

    let mut signature_file = vec![];
    write_attribute(&mut signature_file, "Signature-Version", "1.0");
    write_attribute(&mut signature_file, "Created-By", created_by);
    write_attribute(
        &mut signature_file,
        "SHA-256-Digest-Manifest",
        &encode_digest(&manifest),
    );
    write_attribute(
        &mut signature_file,
        "SHA-256-Digest-Manifest-Main-Attributes",
        &main_attributes_digest,
    );
    signature_file.extend_from_slice(b"\r\n");

    for (name, digest) in section_digests {
        write_attribute(&mut signature_file, "Name", name);
        write_attribute(&mut signature_file, DIGEST_ATTRIBUTE, &digest);
        signature_file.extend_from_slice(b"\r\n");
    }

    SignatureFiles {
        manifest,
        signature_file,
    }
}

/// Whether an entry belongs to the signature and is excluded from signing.
pub fn is_signature_entry(name: &str) -> bool {
    name.starts_with("META-INF/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_names_wrap() {
        let mut out = vec![];
        let name = "a".repeat(200);
        write_attribute(&mut out, "Name", &name);

        let text = String::from_utf8(out).unwrap();
        let lines = text.split_terminator("\r\n").collect::<Vec<_>>();

        assert!(lines.iter().all(|l| l.len() <= MAX_LINE_LENGTH));
        assert!(lines[1..].iter().all(|l| l.starts_with(' ')));

        let unwrapped = lines[0].to_owned()
            + &lines[1..].iter().map(|l| &l[1..]).collect::<String>();
        assert_eq!(unwrapped, format!("Name: {name}"));
    }

    #[test]
    fn short_line_is_untouched() {
        let mut out = vec![];
        write_attribute(&mut out, "Manifest-Version", "1.0");

        assert_eq!(out, b"Manifest-Version: 1.0\r\n");
    }

    #[test]
    fn signature_file_covers_manifest_sections() {
        let digests = BTreeMap::from([
            ("classes.dex".to_owned(), vec![1u8; 32]),
            ("assets/script/a.lua".to_owned(), vec![2u8; 32]),
        ]);

        let files = build(&digests, "apkpatch");
        let manifest = String::from_utf8(files.manifest.clone()).unwrap();
        let sf = String::from_utf8(files.signature_file.clone()).unwrap();

        // Sorted by name.
        let a = manifest.find("Name: assets/script/a.lua").unwrap();
        let c = manifest.find("Name: classes.dex").unwrap();
        assert!(a < c);

        assert!(sf.contains(&format!(
            "SHA-256-Digest-Manifest: {}",
            encode_digest(&files.manifest),
        )));

        let section = "Name: classes.dex\r\nSHA-256-Digest: \
            AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=\r\n\r\n";
        assert!(manifest.ends_with(section));
        assert!(sf.contains(&format!(
            "Name: classes.dex\r\nSHA-256-Digest: {}\r\n",
            encode_digest(section.as_bytes()),
        )));

        assert_eq!(build(&digests, "apkpatch"), files);
    }

    #[test]
    fn signature_entries() {
        assert!(is_signature_entry("META-INF/CERT.RSA"));
        assert!(is_signature_entry("META-INF/services/foo"));
        assert!(!is_signature_entry("assets/META-INF/foo"));
    }
}
