//! QEMU runner.
//!
//! Boots an assembled image with direct kernel boot under UEFI firmware. The
//! system image is attached read-only; a separate qcow2 disk holds user data
//! and survives rebuilds until [`VmRunner::reset`].
//!
//! Firmware comes from `[vm]` config, then the host's OVMF install, then a
//! pinned download through the build cache (see [`crate::firmware`]).

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cache::BuildCache;
use crate::config::VmConfig;
use crate::error::{Error, IoContext, Result};
use crate::firmware::Bundle;
use crate::layout::OutputLayout;
use crate::process::Cmd;
use crate::source::Fetcher;

pub const QEMU: &str = "qemu-system-x86_64";

/// Kernel command line used when none is given.
pub const DEFAULT_APPEND: &str = "console=ttyS0";

/// OVMF firmware pair: code (read-only) and the variable store template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ovmf {
    pub code: PathBuf,
    pub vars: PathBuf,
}

/// Builder for QEMU arguments.
#[derive(Debug, Clone, Default)]
pub struct QemuBuilder {
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    append: Option<String>,
    system_image: Option<PathBuf>,
    user_disk: Option<PathBuf>,
    ovmf_code: Option<PathBuf>,
    ovmf_vars: Option<PathBuf>,
    memory_gb: u32,
    cpus: u32,
    kvm: bool,
    extra: Vec<String>,
}

impl QemuBuilder {
    pub fn new(memory_gb: u32, cpus: u32) -> Self {
        Self {
            memory_gb,
            cpus,
            ..Default::default()
        }
    }

    pub fn kernel(mut self, path: PathBuf, initrd: Option<PathBuf>) -> Self {
        self.kernel = Some(path);
        self.initrd = initrd;
        self
    }

    pub fn append(mut self, cmdline: impl Into<String>) -> Self {
        self.append = Some(cmdline.into());
        self
    }

    pub fn system_image(mut self, path: PathBuf) -> Self {
        self.system_image = Some(path);
        self
    }

    pub fn user_disk(mut self, path: PathBuf) -> Self {
        self.user_disk = Some(path);
        self
    }

    /// UEFI firmware. `vars` must be a writable copy.
    pub fn uefi(mut self, code: PathBuf, vars: PathBuf) -> Self {
        self.ovmf_code = Some(code);
        self.ovmf_vars = Some(vars);
        self
    }

    pub fn kvm(mut self, enabled: bool) -> Self {
        self.kvm = enabled;
        self
    }

    pub fn extra_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra.extend(args);
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

        if self.kvm {
            push(&["-enable-kvm", "-cpu", "host"]);
        } else {
            push(&["-cpu", "max"]);
        }
        push(&["-machine", "q35"]);
        push(&["-smp", &self.cpus.to_string()]);
        push(&["-m", &format!("{}G", self.memory_gb)]);

        if let Some(code) = &self.ovmf_code {
            push(&[
                "-drive",
                &format!("if=pflash,format=raw,readonly=on,file={}", code.display()),
            ]);
        }
        if let Some(vars) = &self.ovmf_vars {
            push(&["-drive", &format!("if=pflash,format=raw,file={}", vars.display())]);
        }

        if let Some(kernel) = &self.kernel {
            push(&["-kernel", &kernel.display().to_string()]);
            if let Some(initrd) = &self.initrd {
                push(&["-initrd", &initrd.display().to_string()]);
            }
            push(&["-append", self.append.as_deref().unwrap_or(DEFAULT_APPEND)]);
        }

        if let Some(image) = &self.system_image {
            push(&[
                "-drive",
                &format!("if=virtio,format=raw,readonly=on,file={}", image.display()),
            ]);
        }
        if let Some(disk) = &self.user_disk {
            push(&["-drive", &format!("if=virtio,format=qcow2,file={}", disk.display())]);
        }

        // Network: virtio-net with user-mode NAT
        push(&["-netdev", "user,id=net0", "-device", "virtio-net-pci,netdev=net0"]);
        push(&["-nographic", "-serial", "mon:stdio"]);

        args.extend(self.extra.iter().cloned());
        args
    }

    pub fn build(&self) -> Cmd {
        Cmd::new(QEMU).args(self.args())
    }
}

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<Ovmf> {
    let candidates = [
        // Arch
        ("/usr/share/edk2/x64/OVMF_CODE.4m.fd", "/usr/share/edk2/x64/OVMF_VARS.4m.fd"),
        ("/usr/share/edk2-ovmf/x64/OVMF_CODE.fd", "/usr/share/edk2-ovmf/x64/OVMF_VARS.fd"),
        // Fedora/RHEL
        ("/usr/share/edk2/ovmf/OVMF_CODE.fd", "/usr/share/edk2/ovmf/OVMF_VARS.fd"),
        // Debian/Ubuntu
        ("/usr/share/OVMF/OVMF_CODE_4M.fd", "/usr/share/OVMF/OVMF_VARS_4M.fd"),
        ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
        // NixOS
        ("/run/libvirt/nix-ovmf/OVMF_CODE.fd", "/run/libvirt/nix-ovmf/OVMF_VARS.fd"),
    ];

    candidates.iter().find_map(|(code, vars)| {
        let (code, vars) = (PathBuf::from(code), PathBuf::from(vars));
        (code.exists() && vars.exists()).then_some(Ovmf { code, vars })
    })
}

/// Runs and resets the development VM.
pub struct VmRunner<'a> {
    layout: &'a OutputLayout,
    config: &'a VmConfig,
    download: Option<FirmwareDownload<'a>>,
}

struct FirmwareDownload<'a> {
    cache: &'a BuildCache,
    fetcher: &'a dyn Fetcher,
    bundle: Bundle<'a>,
}

impl<'a> VmRunner<'a> {
    pub fn new(layout: &'a OutputLayout, config: &'a VmConfig) -> Self {
        Self {
            layout,
            config,
            download: None,
        }
    }

    /// Download `bundle` when no firmware is configured or installed. Its
    /// first two pinned files are the code and vars images.
    pub fn with_firmware_download(
        mut self,
        cache: &'a BuildCache,
        fetcher: &'a dyn Fetcher,
        bundle: Bundle<'a>,
    ) -> Self {
        self.download = Some(FirmwareDownload {
            cache,
            fetcher,
            bundle,
        });
        self
    }

    /// Firmware from config, else a well-known location, else a download.
    pub fn firmware(&self) -> Result<Ovmf> {
        self.firmware_or(find_ovmf())
    }

    fn firmware_or(&self, installed: Option<Ovmf>) -> Result<Ovmf> {
        if let (Some(code), Some(vars)) = (&self.config.ovmf_code, &self.config.ovmf_vars) {
            return Ok(Ovmf {
                code: code.clone(),
                vars: vars.clone(),
            });
        }
        if let Some(ovmf) = installed {
            return Ok(ovmf);
        }
        let Some(download) = &self.download else {
            return Err(Error::not_found(
                "OVMF firmware",
                "set vm.ovmf_code and vm.ovmf_vars",
            ));
        };
        info!("no OVMF installed, using pinned {}", download.bundle.name);
        let files = download.bundle.fetch(download.cache, download.fetcher)?;
        match files.as_slice() {
            [code, vars, ..] => Ok(Ovmf {
                code: code.clone(),
                vars: vars.clone(),
            }),
            _ => Err(Error::not_found(
                "OVMF code and vars images",
                download.bundle.url.to_string(),
            )),
        }
    }

    /// Command line for booting `image`. Prepares the vars copy and user disk.
    /// `extra` is appended verbatim after the generated arguments.
    pub fn command(
        &self,
        image: &Path,
        kernel: &Path,
        initrd: Option<&Path>,
        append: Option<&str>,
        extra: &[String],
    ) -> Result<QemuBuilder> {
        let inputs = [Some(image), Some(kernel), initrd];
        for path in inputs.into_iter().flatten() {
            if !path.is_file() {
                return Err(Error::not_found("VM input", path.display().to_string()));
            }
        }

        let ovmf = self.firmware()?;
        let vm_dir = self.layout.vm_dir();
        fs::create_dir_all(&vm_dir).io_context(|| format!("creating {}", vm_dir.display()))?;
        let vars = self.layout.ovmf_vars_path();
        if !vars.exists() {
            fs::copy(&ovmf.vars, &vars)
                .io_context(|| format!("copying {} to {}", ovmf.vars.display(), vars.display()))?;
        }
        let user_disk = self.layout.user_disk_path();
        if !user_disk.exists() {
            self.create_user_disk(&user_disk)?;
        }

        let mut builder = QemuBuilder::new(self.config.memory_gb, self.config.cpus)
            .kvm(Path::new("/dev/kvm").exists())
            .uefi(ovmf.code, vars)
            .kernel(kernel.to_path_buf(), initrd.map(Path::to_path_buf))
            .system_image(image.to_path_buf())
            .user_disk(user_disk)
            .extra_args(extra.iter().cloned());
        if let Some(append) = append {
            builder = builder.append(append);
        }
        Ok(builder)
    }

    /// Boot the VM with the console attached.
    pub fn run(
        &self,
        image: &Path,
        kernel: &Path,
        initrd: Option<&Path>,
        append: Option<&str>,
        extra: &[String],
    ) -> Result<()> {
        let builder = self.command(image, kernel, initrd, append, extra)?;
        info!("launching {} with {}", QEMU, image.display());
        let code = builder.build().allow_fail().run_interactive()?;
        if code != 0 {
            return Err(Error::Emulator(code));
        }
        Ok(())
    }

    /// Delete and recreate the user-data disk. Images are left alone.
    pub fn reset(&self) -> Result<PathBuf> {
        let user_disk = self.layout.user_disk_path();
        if user_disk.exists() {
            fs::remove_file(&user_disk)
                .io_context(|| format!("removing {}", user_disk.display()))?;
        }
        self.create_user_disk(&user_disk)?;
        info!("user disk reset: {}", user_disk.display());
        Ok(user_disk)
    }

    fn create_user_disk(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        Cmd::new("qemu-img")
            .args(["create", "-f", "qcow2"])
            .arg_path(path)
            .arg(format!("{}G", self.config.user_disk_gb))
            .error_msg("creating user disk")
            .run()?;
        Ok(())
    }
}
