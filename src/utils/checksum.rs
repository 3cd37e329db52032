//! SHA-256/SHA-512 digests for installation media.
//!
//! Expected digests come from the caller, from a `<file>.sha256` or
//! `<file>.sha512` sidecar, or from a `SHA256SUMS`/`SHA512SUMS` list in the
//! same directory, in that order.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Infer the algorithm from a hex digest's length.
    fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            64 => Some(Algorithm::Sha256),
            128 => Some(Algorithm::Sha512),
            _ => None,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn sums_file(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "SHA256SUMS",
            Algorithm::Sha512 => "SHA512SUMS",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A normalised expected digest and where it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub algorithm: Algorithm,
    pub digest: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub path: PathBuf,
    pub algorithm: Algorithm,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// `None` when there was nothing to compare against.
    pub matched: Option<bool>,
}

/// Validate a user-supplied hex digest. Case and surrounding whitespace are
/// ignored.
pub fn parse_digest(raw: &str, source: &str) -> Result<Expected> {
    let digest = raw.trim().to_lowercase();
    hex::decode(&digest).with_context(|| format!("Checksum from {} is not valid hex", source))?;
    let algorithm = Algorithm::from_hex_len(digest.len()).ok_or_else(|| {
        anyhow!(
            "Cannot determine checksum algorithm from length {} ({})",
            digest.len(),
            source
        )
    })?;
    Ok(Expected {
        algorithm,
        digest,
        source: source.to_string(),
    })
}

pub fn digest_file(path: &Path, algorithm: Algorithm) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let reader = BufReader::new(file);
    match algorithm {
        Algorithm::Sha256 => hash_reader::<Sha256>(reader),
        Algorithm::Sha512 => hash_reader::<Sha512>(reader),
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).context("Failed to read file data")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Find a published digest for `path` next to it.
pub fn lookup_expected(path: &Path) -> Result<Option<Expected>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("Not a file path: {}", path.display()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    for algorithm in [Algorithm::Sha256, Algorithm::Sha512] {
        let sidecar = dir.join(format!("{}.{}", file_name, algorithm.extension()));
        if sidecar.is_file() {
            let contents = std::fs::read_to_string(&sidecar)
                .with_context(|| format!("Failed to read checksum file: {}", sidecar.display()))?;
            // Either a bare digest or a single `sha256sum` line.
            let raw = contents.split_whitespace().next().unwrap_or_default();
            return parse_digest(raw, &sidecar.display().to_string()).map(Some);
        }
    }

    for algorithm in [Algorithm::Sha256, Algorithm::Sha512] {
        let sums = dir.join(algorithm.sums_file());
        if !sums.is_file() {
            continue;
        }
        let contents = std::fs::read_to_string(&sums)
            .with_context(|| format!("Failed to read checksum file: {}", sums.display()))?;
        if let Some(raw) = find_in_sums(&contents, &file_name) {
            return parse_digest(raw, &sums.display().to_string()).map(Some);
        }
        debug!("{} has no entry for {}", sums.display(), file_name);
    }
    Ok(None)
}

/// `sha256sum` format: digest, whitespace, optional `*` for binary mode,
/// file name.
fn find_in_sums<'a>(contents: &'a str, file_name: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (digest, name) = line.split_once(char::is_whitespace)?;
        let name = name.trim_start();
        let name = name.strip_prefix('*').unwrap_or(name);
        (name == file_name).then_some(digest)
    })
}

/// Hash `path` and compare against `expected`, or against a published digest
/// found beside the file. With neither, the SHA-256 digest is reported
/// unverified.
pub fn verify_file(path: &Path, expected: Option<Expected>) -> Result<Verification> {
    if !path.is_file() {
        bail!("File not found: {}", path.display());
    }
    let expected = match expected {
        Some(e) => Some(e),
        None => lookup_expected(path)?,
    };
    let algorithm = expected.as_ref().map_or(Algorithm::Sha256, |e| e.algorithm);

    info!("Verifying checksum for: {}", path.display());
    let digest = digest_file(path, algorithm)?;
    let matched = expected.as_ref().map(|e| e.digest == digest);
    if matched == Some(false) {
        debug!("checksum mismatch for {}", path.display());
    }

    Ok(Verification {
        path: path.to_path_buf(),
        algorithm,
        digest,
        expected: expected.as_ref().map(|e| e.digest.clone()),
        source: expected.map(|e| e.source),
        matched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // sha256("hello\n")
    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    #[test]
    fn digest_matches_sha256sum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.iso");
        fs::write(&path, "hello\n").unwrap();
        assert_eq!(digest_file(&path, Algorithm::Sha256).unwrap(), HELLO_SHA256);
        assert_eq!(digest_file(&path, Algorithm::Sha512).unwrap().len(), 128);
    }

    #[test]
    fn explicit_digest_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.iso");
        fs::write(&path, "hello\n").unwrap();

        let expected = parse_digest(&HELLO_SHA256.to_uppercase(), "--sha256").unwrap();
        let v = verify_file(&path, Some(expected)).unwrap();
        assert_eq!(v.matched, Some(true));
        assert_eq!(v.source.as_deref(), Some("--sha256"));
    }

    #[test]
    fn malformed_digests_are_rejected() {
        assert!(parse_digest("xyz", "arg").is_err());
        assert!(parse_digest("abcd", "arg").is_err());
        assert_eq!(parse_digest(&"a".repeat(128), "arg").unwrap().algorithm, Algorithm::Sha512);
    }

    #[test]
    fn sidecar_file_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.iso");
        fs::write(&path, "hello\n").unwrap();
        fs::write(dir.path().join("hello.iso.sha256"), format!("{}  hello.iso\n", HELLO_SHA256)).unwrap();

        let v = verify_file(&path, None).unwrap();
        assert_eq!(v.matched, Some(true));
        assert!(v.source.unwrap().ends_with("hello.iso.sha256"));
    }

    #[test]
    fn sums_list_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.iso");
        fs::write(&path, "tampered\n").unwrap();
        fs::write(
            dir.path().join("SHA256SUMS"),
            format!("{}  other.iso\n{} *hello.iso\n", "0".repeat(64), HELLO_SHA256),
        )
        .unwrap();

        let v = verify_file(&path, None).unwrap();
        assert_eq!(v.expected.as_deref(), Some(HELLO_SHA256));
        assert_eq!(v.matched, Some(false));
    }

    #[test]
    fn nothing_to_compare_is_unverified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.iso");
        fs::write(&path, "hello\n").unwrap();

        let v = verify_file(&path, None).unwrap();
        assert_eq!(v.digest, HELLO_SHA256);
        assert_eq!(v.matched, None);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify_file(&dir.path().join("absent.iso"), None).is_err());
    }
}
