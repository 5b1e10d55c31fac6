//! Local PKGBUILD directories.

use std::path::Path;

use crate::artifact::filesystem::copy_dir_recursive;
use crate::error::{Error, Result};
use crate::fingerprint::{hash_dir, SourceFingerprint};

/// Fingerprint a local directory by content. No network access.
pub fn fingerprint(local_path: &Path) -> Result<SourceFingerprint> {
    if !local_path.is_dir() {
        return Err(Error::not_found(
            "package source directory",
            local_path.display().to_string(),
        ));
    }
    Ok(SourceFingerprint::pkgbuild(&hash_dir(local_path)?))
}

/// Copy the directory into the cache so later edits cannot leak into a build
/// that already fingerprinted it.
pub fn snapshot(local_path: &Path, dest: &Path) -> Result<()> {
    copy_dir_recursive(local_path, dest)
}
