//! Content fingerprints.
//!
//! Every cached object is addressed by a sha256 fingerprint of its inputs:
//!
//! - [`SourceFingerprint`]: source variant tag plus descriptor content (URL and
//!   checksum, repository and resolved commit, or a recursive hash of a local
//!   directory).
//! - [`BuildFingerprint`]: source fingerprint, canonical JSON of the build
//!   options (dependency fingerprints included) and the toolchain identity.
//!
//! Fields are length-prefixed before hashing so adjacent values cannot run
//! into each other.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::manifest::Sha256 as Checksum;

/// Revision of the build contract. Bumping it invalidates every artifact.
pub const BUILD_CONTRACT_VERSION: u32 = 1;

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Fingerprint of a resolved source tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SourceFingerprint(String);

impl SourceFingerprint {
    fn from_fields(tag: &str, fields: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, b"source");
        update_field(&mut hasher, tag.as_bytes());
        for field in fields {
            update_field(&mut hasher, field);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn binary(url: &str, checksum: Option<&Checksum>) -> Self {
        let checksum = checksum.map(Checksum::as_str).unwrap_or("");
        Self::from_fields("binary", &[url.as_bytes(), checksum.as_bytes()])
    }

    pub fn git(repo_url: &str, commit: &str) -> Self {
        Self::from_fields("git", &[repo_url.as_bytes(), commit.as_bytes()])
    }

    /// `tree_hash` is the output of [`hash_dir`] over the local directory.
    pub fn pkgbuild(tree_hash: &str) -> Self {
        Self::from_fields("pkgbuild", &[tree_hash.as_bytes()])
    }

    /// A pinned firmware archive, unpacked.
    pub fn firmware(name: &str, archive_sha256: &str) -> Self {
        Self::from_fields("firmware", &[name.as_bytes(), archive_sha256.as_bytes()])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint of a build. Artifacts are addressed only by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BuildFingerprint(String);

impl BuildFingerprint {
    /// Combine a source fingerprint, serializable build inputs and the
    /// toolchain identity.
    ///
    /// `inputs` is rendered as canonical JSON (object keys sorted).
    pub fn compute<T: Serialize>(
        source: &SourceFingerprint,
        inputs: &T,
        toolchain: &ToolchainIdentity,
    ) -> Result<Self> {
        let value = serde_json::to_value(inputs).map_err(|e| Error::json("build inputs", e))?;
        let canonical =
            serde_json::to_vec(&value).map_err(|e| Error::json("build inputs", e))?;
        let toolchain = serde_json::to_vec(toolchain).map_err(|e| Error::json("toolchain", e))?;

        let mut hasher = Sha256::new();
        update_field(&mut hasher, b"build");
        update_field(&mut hasher, source.as_str().as_bytes());
        update_field(&mut hasher, &canonical);
        update_field(&mut hasher, &toolchain);
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for BuildFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What produced an artifact, besides its inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolchainIdentity {
    /// Container runtime binary name.
    pub runtime: String,
    /// Container image reference.
    pub image: String,
    pub contract: u32,
}

impl ToolchainIdentity {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            contract: BUILD_CONTRACT_VERSION,
        }
    }
}

/// sha256 of a value's canonical JSON under a domain tag.
pub fn digest_json<T: Serialize>(tag: &str, value: &T) -> Result<String> {
    let value = serde_json::to_value(value).map_err(|e| Error::json(tag.to_string(), e))?;
    let canonical = serde_json::to_vec(&value).map_err(|e| Error::json(tag.to_string(), e))?;
    let mut hasher = Sha256::new();
    update_field(&mut hasher, tag.as_bytes());
    update_field(&mut hasher, &canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a file, returning (sha256 hex, size in bytes).
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Recursive content hash of a directory.
///
/// Covers relative paths, permission bits, symlink targets and file contents,
/// visited in sorted order. Timestamps and ownership are ignored.
pub fn hash_dir(root: &Path) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(|p| p.display().to_string()).unwrap_or_default();
            Error::io(
                format!("walking {path}"),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy();
        let md = fs::symlink_metadata(path).io_context(|| format!("stat {}", path.display()))?;
        let mode = md.permissions().mode() & 0o7777;

        update_field(&mut hasher, rel.as_bytes());
        if md.file_type().is_symlink() {
            let target = fs::read_link(path).io_context(|| format!("readlink {}", path.display()))?;
            update_field(&mut hasher, b"l");
            update_field(&mut hasher, target.to_string_lossy().as_bytes());
        } else if md.is_dir() {
            update_field(&mut hasher, b"d");
            update_field(&mut hasher, &mode.to_le_bytes());
        } else {
            let (content, _) = hash_file(path)?;
            update_field(&mut hasher, b"f");
            update_field(&mut hasher, &mode.to_le_bytes());
            update_field(&mut hasher, content.as_bytes());
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}
