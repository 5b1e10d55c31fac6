//! System image assembly.
//!
//! Installs every package artifact into a fresh sysroot in manifest order
//! (later packages overwrite earlier ones), adds the kernel, modules, initrd
//! and EFI loader, writes the credits file and packs the result with
//! `mksquashfs`.
//!
//! Nothing is written unless every manifest package has an artifact. The
//! sysroot is built under a temporary name, packed from there, and only then
//! swapped into place whole. A failed pack leaves the previous sysroot and
//! image as they were.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::filesystem::{copy_dir_filtered, copy_dir_recursive};
use super::squashfs::{build_squashfs, SquashfsOptions};
use crate::build::{InitrdArtifact, KernelArtifact};
use crate::cache::{tmp_name, ArtifactSet};
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{digest_json, hash_file};
use crate::layout::OutputLayout;
use crate::manifest::Manifest;

/// Credits file path inside the image.
pub const CREDITS_PATH: &str = "etc/osforge-credits.json";

/// Where the EFI loader is installed inside the image.
pub const EFI_LOADER_PATH: &str = "boot/EFI/BOOT/BOOTX64.EFI";

/// Author recorded when neither the manifest nor `.PKGINFO` names one.
const UNKNOWN_AUTHOR: &str = "Unknown";

/// An assembled image.
#[derive(Debug, Clone)]
pub struct SystemImage {
    pub sysroot: PathBuf,
    pub image_path: PathBuf,
    /// Digest of every input; an image with the same digest is reused.
    pub fingerprint: String,
    pub reused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageCredit {
    pub name: String,
    pub version: String,
    pub author: String,
}

#[derive(Serialize)]
struct ImageInputs<'a> {
    name: &'a str,
    version: &'a str,
    packages: Vec<(&'a str, &'a str)>,
    kernel: Option<&'a str>,
    initrd: Option<&'a str>,
    bootloader: Option<String>,
    compression: &'a str,
    block_size: &'a str,
    fixed_timestamps: bool,
}

/// Removes a directory on drop unless kept.
struct TempTree {
    path: PathBuf,
    keep: bool,
}

impl Drop for TempTree {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

pub struct Assembler<'a> {
    layout: &'a OutputLayout,
    squashfs: SquashfsOptions,
    bootloader: Option<PathBuf>,
}

impl<'a> Assembler<'a> {
    pub fn new(layout: &'a OutputLayout) -> Self {
        Self {
            layout,
            squashfs: SquashfsOptions::default(),
            bootloader: None,
        }
    }

    pub fn with_squashfs(mut self, options: SquashfsOptions) -> Self {
        self.squashfs = options;
        self
    }

    /// Install `efi` as the image's fallback EFI loader.
    pub fn with_bootloader(mut self, efi: PathBuf) -> Self {
        self.bootloader = Some(efi);
        self
    }

    /// Assemble the image for `manifest` from built artifacts.
    pub fn assemble(
        &self,
        manifest: &Manifest,
        built: &HashMap<String, ArtifactSet>,
        kernel: Option<&KernelArtifact>,
        initrd: Option<&InitrdArtifact>,
    ) -> Result<SystemImage> {
        check_complete(manifest, built, kernel, initrd)?;

        let fingerprint = self.input_fingerprint(manifest, built, kernel, initrd)?;
        let sysroot = self.layout.sysroot_dir();
        let image_path = self.layout.image_path(&manifest.name, &manifest.version);
        let sidecar = sidecar_path(&image_path);

        let recorded = fs::read_to_string(&sidecar).unwrap_or_default();
        if recorded.trim() == fingerprint && image_path.is_file() && sysroot.is_dir() {
            info!("image {} up to date", image_path.display());
            return Ok(SystemImage {
                sysroot,
                image_path,
                fingerprint,
                reused: true,
            });
        }

        let tree = self.build_tree(manifest, built, kernel, initrd)?;
        // Drop the stale record first so a failed pack cannot look current.
        if sidecar.exists() {
            fs::remove_file(&sidecar).io_context(|| format!("removing {}", sidecar.display()))?;
        }
        build_squashfs(&tree.path, &image_path, &self.squashfs)?;
        self.swap_in(tree)?;
        fs::write(&sidecar, format!("{fingerprint}\n"))
            .io_context(|| format!("writing {}", sidecar.display()))?;

        Ok(SystemImage {
            sysroot,
            image_path,
            fingerprint,
            reused: false,
        })
    }

    /// Build the sysroot and swap it into place. Returns its path.
    pub fn materialize(
        &self,
        manifest: &Manifest,
        built: &HashMap<String, ArtifactSet>,
        kernel: Option<&KernelArtifact>,
        initrd: Option<&InitrdArtifact>,
    ) -> Result<PathBuf> {
        let tree = self.build_tree(manifest, built, kernel, initrd)?;
        self.swap_in(tree)
    }

    /// Populate a temporary sysroot beside the final one.
    fn build_tree(
        &self,
        manifest: &Manifest,
        built: &HashMap<String, ArtifactSet>,
        kernel: Option<&KernelArtifact>,
        initrd: Option<&InitrdArtifact>,
    ) -> Result<TempTree> {
        check_complete(manifest, built, kernel, initrd)?;

        let root = self.layout.root();
        fs::create_dir_all(root).io_context(|| format!("creating {}", root.display()))?;
        let tree = TempTree {
            path: root.join(format!(".{}", tmp_name("sysroot"))),
            keep: false,
        };
        fs::create_dir_all(&tree.path).io_context(|| format!("creating {}", tree.path.display()))?;

        let mut credits = Vec::with_capacity(manifest.packages.len());
        for pkg in &manifest.packages {
            let Some(set) = built.get(&pkg.name) else {
                continue;
            };
            debug!("installing {}@{}", pkg.name, pkg.version);
            copy_dir_filtered(&set.root, &tree.path, |name| !name.starts_with('.'))?;

            let author = pkg
                .author
                .clone()
                .or_else(|| packager(&set.root))
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
            credits.push(PackageCredit {
                name: pkg.name.clone(),
                version: pkg.version.clone(),
                author,
            });
        }

        if let Some(kernel) = kernel {
            install_file(&kernel.image_path, &tree.path.join("boot/vmlinuz"))?;
            if kernel.modules_path.is_dir() {
                copy_dir_recursive(&kernel.modules_path, &tree.path.join("usr/lib/modules"))?;
            }
        }
        if let Some(initrd) = initrd {
            install_file(&initrd.image_path, &tree.path.join("boot/initramfs.img"))?;
        }
        if let Some(efi) = &self.bootloader {
            install_file(efi, &tree.path.join(EFI_LOADER_PATH))?;
        }

        let credits_path = tree.path.join(CREDITS_PATH);
        if let Some(parent) = credits_path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&credits)
            .map_err(|e| Error::json("credits", e))?;
        fs::write(&credits_path, json)
            .io_context(|| format!("writing {}", credits_path.display()))?;
        debug!("staged {} package(s) in {}", credits.len(), tree.path.display());
        Ok(tree)
    }

    /// Replace the sysroot with a finished tree.
    fn swap_in(&self, mut tree: TempTree) -> Result<PathBuf> {
        let sysroot = self.layout.sysroot_dir();
        if sysroot.exists() {
            fs::remove_dir_all(&sysroot).io_context(|| format!("removing {}", sysroot.display()))?;
        }
        fs::rename(&tree.path, &sysroot)
            .io_context(|| format!("moving sysroot into {}", sysroot.display()))?;
        tree.keep = true;
        info!("sysroot ready at {}", sysroot.display());
        Ok(sysroot)
    }

    fn input_fingerprint(
        &self,
        manifest: &Manifest,
        built: &HashMap<String, ArtifactSet>,
        kernel: Option<&KernelArtifact>,
        initrd: Option<&InitrdArtifact>,
    ) -> Result<String> {
        let inputs = ImageInputs {
            name: &manifest.name,
            version: &manifest.version,
            packages: manifest
                .packages
                .iter()
                .filter_map(|p| built.get(&p.name).map(|s| (p.name.as_str(), s.fingerprint.as_str())))
                .collect(),
            kernel: kernel.map(|k| k.fingerprint.as_str()),
            initrd: initrd.map(|i| i.fingerprint.as_str()),
            bootloader: match &self.bootloader {
                Some(efi) => Some(hash_file(efi)?.0),
                None => None,
            },
            compression: &self.squashfs.compression,
            block_size: &self.squashfs.block_size,
            fixed_timestamps: self.squashfs.fixed_timestamps,
        };
        // Authors are not part of any artifact, only of the credits file.
        let authors: Vec<Option<&str>> = manifest.packages.iter().map(|p| p.author.as_deref()).collect();
        digest_json("image", &(inputs, authors))
    }
}

/// Fail with every missing unit before anything is written.
fn check_complete(
    manifest: &Manifest,
    built: &HashMap<String, ArtifactSet>,
    kernel: Option<&KernelArtifact>,
    initrd: Option<&InitrdArtifact>,
) -> Result<()> {
    let mut missing: Vec<String> = manifest
        .packages
        .iter()
        .filter(|p| !built.contains_key(&p.name))
        .map(|p| p.name.clone())
        .collect();
    if manifest.kernel.is_some() && kernel.is_none() {
        missing.push("kernel".to_string());
    }
    if manifest.initrd.is_some() && initrd.is_none() {
        missing.push("initrd".to_string());
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::IncompleteManifest { missing })
    }
}

fn install_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    fs::copy(from, to).io_context(|| format!("installing {}", from.display()))?;
    Ok(())
}

fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".fingerprint");
    PathBuf::from(name)
}

/// `packager` from the `.PKGINFO` at an artifact root.
fn packager(root: &Path) -> Option<String> {
    let contents = fs::read_to_string(root.join(".PKGINFO")).ok()?;
    parse_pkginfo(&contents).remove("packager")
}

/// `key = value` pairs of a `.PKGINFO`. Repeated keys keep the first value.
pub fn parse_pkginfo(contents: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in contents.lines() {
        if line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(" = ") {
            fields
                .entry(key.trim().to_string())
                .or_insert_with(|| value.trim().trim_matches('"').to_string());
        }
    }
    fields
}
