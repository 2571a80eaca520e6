//! MD5 digests and `checksums.md5` manifest verification.
//!
//! Package integrity is checksum-only: a `checksums.md5` file at the package
//! root lists `"<md5>  <path>"` per line, package-root-relative.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Compute the MD5 digest of a file as a lowercase hex string.
pub fn md5_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn md5_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Verify a single file against an expected digest.
pub fn verify_file(path: &Path, expected: &str) -> std::io::Result<bool> {
    Ok(md5_file(path)?.eq_ignore_ascii_case(expected))
}

/// One entry of a checksum manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub digest: String,
    pub path: PathBuf,
}

/// Parse a `checksums.md5`-style file: one `"<md5>  <path>"` per line,
/// blank lines ignored.
pub fn parse_md5_manifest(path: &Path) -> Result<Vec<ChecksumEntry>> {
    let file = File::open(path)
        .map_err(|e| EngineError::Integrity(format!("cannot open {}: {}", path.display(), e)))?;
    let mut entries = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, char::is_whitespace);
        match (parts.next(), parts.next()) {
            (Some(digest), Some(rel)) if digest.len() == 32 => entries.push(ChecksumEntry {
                digest: digest.to_ascii_lowercase(),
                path: PathBuf::from(rel.trim()),
            }),
            _ => {
                return Err(EngineError::Integrity(format!(
                    "malformed checksum line {} in {}",
                    lineno + 1,
                    path.display()
                )))
            }
        }
    }
    Ok(entries)
}

/// Verify every manifest entry against the tree rooted at `root`.
/// Fails on the first missing or mismatching file.
pub fn verify_tree(root: &Path, entries: &[ChecksumEntry]) -> Result<()> {
    for entry in entries {
        let path = root.join(&entry.path);
        if !path.is_file() {
            return Err(EngineError::Integrity(format!(
                "listed file missing: {}",
                entry.path.display()
            )));
        }
        if !verify_file(&path, &entry.digest)? {
            return Err(EngineError::Integrity(format!(
                "checksum mismatch: {}",
                entry.path.display()
            )));
        }
    }
    Ok(())
}
