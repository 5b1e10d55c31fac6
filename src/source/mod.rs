//! Source resolution.
//!
//! Maps each package's [`SourceDescriptor`] to a fingerprinted tree in the
//! cache's source namespace:
//!
//! - `binary`: the archive at `url`, checksum-verified when one is declared.
//! - `git`: the repository at the commit `rev` resolves to, without `.git`.
//! - `pkgbuild`: a snapshot of the local directory.
//!
//! Unchanged descriptors resolve to the same fingerprint and reuse the cached
//! tree. Binary and local sources then need no network at all; git sources
//! re-run `git ls-remote` so moving refs are noticed.

pub mod fetch;
pub mod git;
pub mod local;

pub use fetch::{Fetcher, HttpFetcher, RetryingFetcher};

use std::path::PathBuf;
use tracing::debug;

use crate::cache::BuildCache;
use crate::error::Result;
use crate::fingerprint::SourceFingerprint;
use crate::manifest::{PackageSpec, SourceDescriptor};

/// A source tree ready to build from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub fingerprint: SourceFingerprint,
    pub tree_path: PathBuf,
}

pub struct SourceResolver<'a> {
    cache: &'a BuildCache,
    fetcher: &'a dyn Fetcher,
}

impl<'a> SourceResolver<'a> {
    pub fn new(cache: &'a BuildCache, fetcher: &'a dyn Fetcher) -> Self {
        Self { cache, fetcher }
    }

    pub fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedSource> {
        debug!("resolving {} source for {}", spec.source.kind(), spec.name);
        self.resolve_descriptor(&spec.source)
    }

    /// Fingerprint a descriptor without fetching its content.
    ///
    /// Git revisions are still resolved remotely; local trees are hashed.
    pub fn fingerprint(&self, descriptor: &SourceDescriptor) -> Result<SourceFingerprint> {
        match descriptor {
            SourceDescriptor::Binary { url, checksum } => {
                Ok(SourceFingerprint::binary(url, checksum.as_ref()))
            }
            SourceDescriptor::Git { repo_url, rev } => {
                let commit = git::resolve_rev(repo_url, rev)?;
                Ok(SourceFingerprint::git(repo_url, &commit))
            }
            SourceDescriptor::Pkgbuild { local_path } => local::fingerprint(local_path),
        }
    }

    /// Resolve a descriptor that is not tied to a package (the kernel tarball).
    pub fn resolve_descriptor(&self, descriptor: &SourceDescriptor) -> Result<ResolvedSource> {
        let (fingerprint, tree_path) = match descriptor {
            SourceDescriptor::Binary { url, checksum } => {
                let fp = SourceFingerprint::binary(url, checksum.as_ref());
                let tree = self.cache.put_source(&fp, |tree| {
                    fetch::download_verified(self.fetcher, url, checksum.as_ref(), tree).map(|_| ())
                })?;
                (fp, tree)
            }
            SourceDescriptor::Git { repo_url, rev } => {
                let commit = git::resolve_rev(repo_url, rev)?;
                let fp = SourceFingerprint::git(repo_url, &commit);
                let tree = self
                    .cache
                    .put_source(&fp, |tree| git::checkout(repo_url, &commit, tree))?;
                (fp, tree)
            }
            SourceDescriptor::Pkgbuild { local_path } => {
                let fp = local::fingerprint(local_path)?;
                let tree = self
                    .cache
                    .put_source(&fp, |tree| local::snapshot(local_path, tree))?;
                (fp, tree)
            }
        };
        Ok(ResolvedSource {
            fingerprint,
            tree_path,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::{Error, IoContext};
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned bodies and counts requests.
    #[derive(Default)]
    pub struct FakeFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        pub calls: AtomicUsize,
    }

    impl FakeFetcher {
        pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.bodies
                .lock()
                .unwrap()
                .insert(url.to_string(), body.into());
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Fetcher for FakeFetcher {
        fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.bodies.lock().unwrap().get(url).cloned();
            match body {
                Some(body) => std::fs::write(dest, body).io_context(|| "writing fake download"),
                None => Err(Error::not_found("remote file (HTTP 404)", url)),
            }
        }
    }
}
