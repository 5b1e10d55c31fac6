//! Output directory layout.
//!
//! ```text
//! <root>/
//!   cache/{sources,artifacts,tmp,locks}/
//!   work/<package>/
//!   sysroot/
//!   images/<name>-<version>.squashfs
//!   kernel/vmlinuz-<release>
//!   initrd/initramfs.img
//!   vm/{user.qcow2,OVMF_VARS.fd}
//! ```

use std::path::{Path, PathBuf};

/// Paths under the output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Scratch location for one package build. Cleaned before every attempt.
    pub fn work_dir(&self, package: &str) -> PathBuf {
        self.root.join("work").join(package)
    }

    pub fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn sysroot_dir(&self) -> PathBuf {
        self.root.join("sysroot")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn image_path(&self, name: &str, version: &str) -> PathBuf {
        self.images_dir().join(format!("{name}-{version}.squashfs"))
    }

    pub fn kernel_dir(&self) -> PathBuf {
        self.root.join("kernel")
    }

    pub fn kernel_image_path(&self, release: &str) -> PathBuf {
        self.kernel_dir().join(format!("vmlinuz-{release}"))
    }

    pub fn initrd_dir(&self) -> PathBuf {
        self.root.join("initrd")
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.initrd_dir().join("initramfs.img")
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.root.join("vm")
    }

    pub fn user_disk_path(&self) -> PathBuf {
        self.vm_dir().join("user.qcow2")
    }

    pub fn ovmf_vars_path(&self) -> PathBuf {
        self.vm_dir().join("OVMF_VARS.fd")
    }
}
