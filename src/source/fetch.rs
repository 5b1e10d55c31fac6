//! Network fetches.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, IoContext, Result};

/// Downloads a URL to a local file.
///
/// Implementations report HTTP 4xx as [`Error::NotFound`] and transient
/// failures as [`Error::Fetch`], which callers may retry.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Blocking HTTP(S) fetcher with a per-request timeout.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self.agent.get(url).call().map_err(|e| match e {
            ureq::Error::StatusCode(code) if (400..500).contains(&code) => {
                Error::not_found(format!("remote file (HTTP {code})"), url)
            }
            other => Error::Fetch {
                url: url.to_string(),
                attempts: 1,
                reason: other.to_string(),
            },
        })?;

        let mut reader = resp.into_body().into_reader();
        let mut file = File::create(dest).io_context(|| format!("creating {}", dest.display()))?;
        io::copy(&mut reader, &mut file).map_err(|e| Error::Fetch {
            url: url.to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

/// Wraps a fetcher with bounded retries and linear backoff.
pub struct RetryingFetcher<F> {
    inner: F,
    attempts: u32,
    backoff: Duration,
}

impl<F: Fetcher> RetryingFetcher<F> {
    /// `attempts` is the total number of tries, at least one.
    pub fn new(inner: F, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl<F: Fetcher> Fetcher for RetryingFetcher<F> {
    fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.fetch(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    let delay = self.backoff * attempt;
                    warn!(
                        "fetch {} failed (attempt {}/{}): {}; retrying in {:?}",
                        url, attempt, self.attempts, e, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(Error::Fetch { url, reason, .. }) => {
                    return Err(Error::Fetch {
                        url,
                        attempts: attempt,
                        reason,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Download `url` into `dir`, verifying `checksum` when given.
///
/// Returns the path of the downloaded file. A mismatch fails with
/// [`Error::Integrity`]; the caller's scratch directory is then discarded.
pub fn download_verified(
    fetcher: &dyn Fetcher,
    url: &str,
    checksum: Option<&crate::manifest::Sha256>,
    dir: &Path,
) -> Result<std::path::PathBuf> {
    let dest = dir.join(file_name_from_url(url));
    info!("fetching {}", url);
    fetcher.fetch(url, &dest)?;

    if let Some(expected) = checksum {
        let (actual, _) = crate::fingerprint::hash_file(&dest)?;
        if !expected.matches(&actual) {
            return Err(Error::Integrity {
                url: url.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(dest)
}

/// Last path segment of a URL without query or fragment.
pub fn file_name_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || name == ".." || name == "." {
        "download".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        retryable: bool,
    }

    impl Fetcher for Flaky {
        fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                if self.retryable {
                    return Err(Error::Fetch {
                        url: url.to_string(),
                        attempts: 1,
                        reason: "connection reset".to_string(),
                    });
                }
                return Err(Error::not_found("remote file (HTTP 404)", url));
            }
            std::fs::write(dest, b"test").io_context(|| "write")
        }
    }

    #[test]
    fn retries_transient_failures() {
        let tmp = TempDir::new().unwrap();
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 2,
                calls: AtomicU32::new(0),
                retryable: true,
            },
            3,
            Duration::from_millis(1),
        );
        fetcher.fetch("https://example.invalid/x", &tmp.path().join("x")).unwrap();
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reports_attempt_count_when_exhausted() {
        let tmp = TempDir::new().unwrap();
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 10,
                calls: AtomicU32::new(0),
                retryable: true,
            },
            2,
            Duration::from_millis(1),
        );
        let err = fetcher
            .fetch("https://example.invalid/x", &tmp.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { attempts: 2, .. }));
    }

    #[test]
    fn not_found_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let fetcher = RetryingFetcher::new(
            Flaky {
                failures: 1,
                calls: AtomicU32::new(0),
                retryable: false,
            },
            5,
            Duration::from_millis(1),
        );
        let err = fetcher
            .fetch("https://example.invalid/x", &tmp.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn file_names_strip_query() {
        assert_eq!(
            file_name_from_url("https://example.org/pkgs/hello-1.0-1-x86_64.pkg.tar.zst?sig=1"),
            "hello-1.0-1-x86_64.pkg.tar.zst"
        );
        assert_eq!(file_name_from_url("https://example.org/"), "download");
    }
}
