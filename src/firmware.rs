//! Pinned firmware downloads.
//!
//! The UEFI firmware for the development VM and the EFI boot loader installed
//! into images come from upstream archives with known digests. The archive
//! and every file taken from it are checked before use; the unpacked tree is
//! kept in the cache's source namespace under [`SourceFingerprint::firmware`].
//!
//! Upstream release bumps change the archive digest. Until the pins here are
//! updated, a host install or `vm.ovmf_code`/`vm.ovmf_vars` has to be used.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::artifact::filesystem::unpack_archive;
use crate::cache::BuildCache;
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{hash_file, SourceFingerprint};
use crate::source::fetch::download_verified;
use crate::source::Fetcher;

/// A file inside a bundle and its sha256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedFile<'a> {
    pub path: &'a str,
    pub sha256: &'a str,
}

/// A downloadable archive of firmware files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bundle<'a> {
    pub name: &'a str,
    pub url: &'a str,
    /// sha256 of the archive itself.
    pub sha256: &'a str,
    pub files: &'a [PinnedFile<'a>],
}

/// Arch's edk2-ovmf package: OVMF code and variable store template.
pub const EDK2_OVMF: Bundle<'static> = Bundle {
    name: "edk2-ovmf",
    url: "https://archlinux.org/packages/extra/any/edk2-ovmf/download/",
    sha256: "1d7fa267bf90be35d5a792b14769226e5d371aada87619b4f4dbdb621a552f3e",
    files: &[
        PinnedFile {
            path: "usr/share/edk2/x64/OVMF_CODE.4m.fd",
            sha256: "92972b8ae68e808e33dd2e06c09cfd0766d654450c64c8979260b6c90fee2991",
        },
        PinnedFile {
            path: "usr/share/edk2/x64/OVMF_VARS.4m.fd",
            sha256: "5d2ac383371b408398accee7ec27c8c09ea5b74a0de0ceea6513388b15be5d1e",
        },
    ],
};

/// Limine binary release: the x86_64 EFI loader.
pub const LIMINE: Bundle<'static> = Bundle {
    name: "limine",
    url: "https://github.com/limine-bootloader/limine/archive/refs/tags/v10.2.1-binary.tar.gz",
    sha256: "ceefe62652ce4006a50766a40fdc22a351044269e5705233e9cf254fbba0ddc0",
    files: &[PinnedFile {
        path: "limine-10.2.1-binary/BOOTX64.EFI",
        sha256: "771ffd71164d9441bccf20c8302f7b7d4a6714024437bd58b74b20eb6a8c524e",
    }],
};

impl Bundle<'_> {
    pub fn fingerprint(&self) -> SourceFingerprint {
        SourceFingerprint::firmware(self.name, &self.sha256.to_ascii_lowercase())
    }

    /// Paths of the pinned files, in declaration order.
    ///
    /// Downloads and verifies the bundle on first use; later calls are served
    /// from the cache without network.
    pub fn fetch(&self, cache: &BuildCache, fetcher: &dyn Fetcher) -> Result<Vec<PathBuf>> {
        let tree = cache.put_source(&self.fingerprint(), |tree| {
            info!("fetching {} firmware", self.name);
            let download = tree.join(".download");
            fs::create_dir_all(&download)
                .io_context(|| format!("creating {}", download.display()))?;
            let archive = download_verified(fetcher, self.url, None, &download)?;
            verify(&archive, self.sha256, self.url)?;
            unpack_archive(&archive, tree)?;
            fs::remove_dir_all(&download)
                .io_context(|| format!("removing {}", download.display()))?;
            for file in self.files {
                verify(&tree.join(file.path), file.sha256, self.url)?;
            }
            Ok(())
        })?;

        self.files
            .iter()
            .map(|file| {
                let path = tree.join(file.path);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::not_found(
                        format!("{} firmware file", self.name),
                        path.display().to_string(),
                    ))
                }
            })
            .collect()
    }
}

fn verify(path: &Path, expected: &str, url: &str) -> Result<()> {
    if !path.is_file() {
        return Err(Error::not_found(
            format!("file from {url}"),
            path.display().to_string(),
        ));
    }
    let (actual, _) = hash_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::Integrity {
            url: format!("{url} ({})", path.display()),
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestBundle;
    use super::*;
    use crate::source::testing::FakeFetcher;
    use tempfile::TempDir;

    const URL: &str = "https://example.org/firmware/download/";

    #[test]
    fn verified_files_are_cached() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let fixture = TestBundle::new(tmp.path(), URL, &[("fw/CODE.fd", "code"), ("fw/VARS.fd", "vars")]);
        let fetcher = FakeFetcher::default();
        fetcher.serve(URL, fixture.archive.clone());
        let pinned = fixture.pinned();
        let bundle = fixture.bundle("test-fw", &pinned);

        let paths = bundle.fetch(&cache, &fetcher).unwrap();
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "code");
        assert_eq!(fs::read_to_string(&paths[1]).unwrap(), "vars");
        assert!(!paths[0].parent().unwrap().parent().unwrap().join(".download").exists());

        let again = bundle.fetch(&cache, &fetcher).unwrap();
        assert_eq!(again, paths);
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn archive_digest_mismatch_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let fixture = TestBundle::new(tmp.path(), URL, &[("fw/CODE.fd", "code")]);
        let fetcher = FakeFetcher::default();
        fetcher.serve(URL, b"tampered".to_vec());
        let pinned = fixture.pinned();
        let bundle = fixture.bundle("test-fw", &pinned);

        let err = bundle.fetch(&cache, &fetcher).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(cache.get_source(&bundle.fingerprint()).unwrap().is_none());
    }

    #[test]
    fn member_digest_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = BuildCache::open(&tmp.path().join("cache")).unwrap();
        let fixture = TestBundle::new(tmp.path(), URL, &[("BOOTX64.EFI", "efi")]);
        let fetcher = FakeFetcher::default();
        fetcher.serve(URL, fixture.archive.clone());
        let wrong = [PinnedFile {
            path: "BOOTX64.EFI",
            sha256: "0000000000000000000000000000000000000000000000000000000000000000",
        }];
        let bundle = fixture.bundle("test-efi", &wrong);

        match bundle.fetch(&cache, &fetcher) {
            Err(Error::Integrity { url, .. }) => assert!(url.contains("BOOTX64.EFI")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn pinned_bundles_have_distinct_keys() {
        assert_ne!(EDK2_OVMF.fingerprint(), LIMINE.fingerprint());
        assert_eq!(EDK2_OVMF.files.len(), 2);
        assert!(LIMINE.files[0].path.ends_with("BOOTX64.EFI"));
    }
}
