//! Top-level operations over one manifest.
//!
//! A [`Pipeline`] owns the cache, the fetcher and the execution context for a
//! single invocation. Package, kernel and initrd builds run concurrently;
//! assembly only ever sees their joined results.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::artifact::{Assembler, SystemImage};
use crate::build::{
    DockerContext, ExecutionContext, InitrdArtifact, InitrdBuilder, KernelArtifact, KernelBuilder,
    PackageBuilder,
};
use crate::cache::{ArtifactSet, BuildCache, CacheStatus, GcStats};
use crate::config::Config;
use crate::error::{Error, IoContext, Result};
use crate::firmware::{EDK2_OVMF, LIMINE};
use crate::layout::OutputLayout;
use crate::manifest::Manifest;
use crate::qemu::VmRunner;
use crate::source::{Fetcher, HttpFetcher, ResolvedSource, RetryingFetcher, SourceResolver};

/// Unit name used for the kernel in reports.
pub const KERNEL_UNIT: &str = "kernel";
/// Unit name used for the initrd in reports.
pub const INITRD_UNIT: &str = "initrd";

/// Per-unit results of a full build.
#[derive(Debug)]
pub struct BuildReport {
    pub packages: Vec<(String, Result<ArtifactSet>)>,
    pub kernel: Option<Result<KernelArtifact>>,
    pub initrd: Option<Result<InitrdArtifact>>,
}

impl BuildReport {
    /// Every failed unit by name.
    pub fn failures(&self) -> Vec<(&str, &Error)> {
        let mut failed: Vec<(&str, &Error)> = self
            .packages
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name.as_str(), e)))
            .collect();
        if let Some(Err(e)) = &self.kernel {
            failed.push((KERNEL_UNIT, e));
        }
        if let Some(Err(e)) = &self.initrd {
            failed.push((INITRD_UNIT, e));
        }
        failed
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn built(&self) -> HashMap<String, ArtifactSet> {
        self.packages
            .iter()
            .filter_map(|(name, r)| r.as_ref().ok().map(|set| (name.clone(), set.clone())))
            .collect()
    }
}

/// What `status` reports.
#[derive(Debug)]
pub struct Status {
    pub cache: CacheStatus,
    pub image: Option<PathBuf>,
    pub sysroot: Option<PathBuf>,
}

pub struct Pipeline<'a> {
    manifest: &'a Manifest,
    config: &'a Config,
    layout: OutputLayout,
    cache: BuildCache,
    fetcher: Box<dyn Fetcher>,
    context: Box<dyn ExecutionContext>,
}

impl<'a> Pipeline<'a> {
    /// Pipeline using HTTP and the configured container runtime.
    pub fn new(manifest: &'a Manifest, config: &'a Config) -> Result<Self> {
        let fetcher = RetryingFetcher::new(
            HttpFetcher::new(Duration::from_secs(config.fetch_timeout_secs)),
            config.fetch_retries,
            Duration::from_secs(2),
        );
        let context = DockerContext::new(&config.container_runtime);
        Self::with_backends(manifest, config, Box::new(fetcher), Box::new(context))
    }

    pub fn with_backends(
        manifest: &'a Manifest,
        config: &'a Config,
        fetcher: Box<dyn Fetcher>,
        context: Box<dyn ExecutionContext>,
    ) -> Result<Self> {
        let layout = OutputLayout::new(&config.output_dir);
        let cache = BuildCache::open(&layout.cache_dir())?;
        Ok(Self {
            manifest,
            config,
            layout,
            cache,
            fetcher,
            context,
        })
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    fn packages(&self) -> PackageBuilder<'_> {
        PackageBuilder::new(
            &self.cache,
            &*self.fetcher,
            &*self.context,
            &self.layout,
            self.manifest,
        )
    }

    fn kernel_builder(&self) -> KernelBuilder<'_> {
        KernelBuilder::new(
            &self.cache,
            &*self.fetcher,
            &*self.context,
            &self.layout,
            &self.config.kernel_image,
            self.config.jobs,
        )
    }

    /// Resolve every package source and the kernel tarball into the cache.
    pub fn fetch(&self) -> Vec<(String, Result<ResolvedSource>)> {
        let resolver = SourceResolver::new(&self.cache, &*self.fetcher);
        let mut units: Vec<(&str, &crate::manifest::SourceDescriptor)> = self
            .manifest
            .packages
            .iter()
            .map(|p| (p.name.as_str(), &p.source))
            .collect();
        let kernel_source = self.manifest.kernel.as_ref().map(|k| k.source());
        if let Some(source) = &kernel_source {
            units.push((KERNEL_UNIT, source));
        }

        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<ResolvedSource>>>> =
            Mutex::new(units.iter().map(|_| None).collect());
        let workers = self.config.jobs.clamp(1, units.len().max(1));
        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some((name, source)) = units.get(i) else { break };
                    info!("fetching {} source for {}", source.kind(), name);
                    let result = resolver.resolve_descriptor(source);
                    if let Ok(mut slots) = slots.lock() {
                        slots[i] = Some(result);
                    }
                });
            }
        });

        let slots = slots.into_inner().unwrap_or_else(|e| e.into_inner());
        units
            .iter()
            .zip(slots)
            .map(|((name, _), slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(Error::not_found("fetch result", name.to_string()))
                });
                (name.to_string(), result)
            })
            .collect()
    }

    /// Build every package, the kernel and the initrd concurrently.
    ///
    /// Returns once all of them have finished; one failure never stops the
    /// others.
    pub fn build(&self) -> Result<BuildReport> {
        let order = self.manifest.build_order()?;
        let report = std::thread::scope(|s| {
            let kernel = self.manifest.kernel.as_ref().map(|spec| {
                s.spawn(move || self.kernel_builder().build(spec))
            });
            let initrd = self.manifest.initrd.as_ref().map(|spec| {
                s.spawn(move || InitrdBuilder::new(&self.cache, &self.layout).build(spec))
            });

            let mut packages = self.packages().build_all(&order, self.config.jobs);
            // Report in manifest order.
            packages.sort_by_key(|(name, _)| {
                self.manifest
                    .packages
                    .iter()
                    .position(|p| &p.name == name)
                    .unwrap_or(usize::MAX)
            });

            BuildReport {
                packages,
                kernel: kernel.map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::Kernel {
                            stage: "join",
                            reason: "kernel build thread panicked".to_string(),
                        })
                    })
                }),
                initrd: initrd.map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::Initrd {
                            script: self
                                .manifest
                                .initrd
                                .as_ref()
                                .map(|s| s.build_script.clone())
                                .unwrap_or_default(),
                            exit_code: -1,
                        })
                    })
                }),
            }
        });

        for (unit, err) in report.failures() {
            warn!("{} failed: {}", unit, err);
        }
        Ok(report)
    }

    /// Build the kernel alone.
    pub fn build_kernel(&self) -> Result<KernelArtifact> {
        let spec = self
            .manifest
            .kernel
            .as_ref()
            .ok_or_else(|| Error::InvalidManifest("no [kernel] section".to_string()))?;
        self.kernel_builder().build(spec)
    }

    /// Build the initrd alone.
    pub fn build_initrd(&self) -> Result<InitrdArtifact> {
        let spec = self
            .manifest
            .initrd
            .as_ref()
            .ok_or_else(|| Error::InvalidManifest("no [initrd] section".to_string()))?;
        InitrdBuilder::new(&self.cache, &self.layout).build(spec)
    }

    /// Assemble the image from a finished build.
    pub fn assemble(&self, report: &BuildReport) -> Result<SystemImage> {
        let built = report.built();
        let kernel = report.kernel.as_ref().and_then(|r| r.as_ref().ok());
        let initrd = report.initrd.as_ref().and_then(|r| r.as_ref().ok());
        let mut assembler = Assembler::new(&self.layout);
        if self.manifest.bootloader {
            let efi = LIMINE
                .fetch(&self.cache, &*self.fetcher)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::not_found("EFI loader", LIMINE.url))?;
            assembler = assembler.with_bootloader(efi);
        }
        let image = assembler.assemble(self.manifest, &built, kernel, initrd)?;
        info!("image ready: {}", image.image_path.display());
        Ok(image)
    }

    /// Every cache key the current manifest references.
    ///
    /// Fails if any unit cannot be planned; a partial live set would let GC
    /// delete entries still in use.
    pub fn live_set(&self) -> Result<HashSet<String>> {
        let mut live = HashSet::new();
        let packages = self.packages();
        for spec in &self.manifest.packages {
            let (fp, sources) = packages.plan(spec)?;
            live.insert(fp.as_str().to_string());
            live.extend(sources.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(spec) = &self.manifest.kernel {
            let resolver = SourceResolver::new(&self.cache, &*self.fetcher);
            live.insert(resolver.fingerprint(&spec.source())?.as_str().to_string());
            live.insert(self.kernel_builder().plan(spec)?.as_str().to_string());
        }
        if let Some(spec) = &self.manifest.initrd {
            let fp = InitrdBuilder::new(&self.cache, &self.layout).plan(spec)?;
            live.insert(fp.as_str().to_string());
        }
        live.insert(EDK2_OVMF.fingerprint().as_str().to_string());
        if self.manifest.bootloader {
            live.insert(LIMINE.fingerprint().as_str().to_string());
        }
        Ok(live)
    }

    /// Drop every cache entry the current manifest does not reference.
    pub fn gc(&self) -> Result<GcStats> {
        let live = self.live_set()?;
        let stats = self.cache.garbage_collect(&live)?;
        info!(
            "gc removed {} source(s), {} artifact(s), {} temp dir(s)",
            stats.removed_sources, stats.removed_artifacts, stats.removed_temp
        );
        Ok(stats)
    }

    /// Remove work directories, the sysroot and images. With `all`, also the
    /// kernel and initrd outputs, the VM state and the cache.
    pub fn clean(&self, all: bool) -> Result<()> {
        let mut targets = vec![
            self.layout.work_root(),
            self.layout.sysroot_dir(),
            self.layout.images_dir(),
        ];
        if all {
            targets.extend([
                self.layout.kernel_dir(),
                self.layout.initrd_dir(),
                self.layout.vm_dir(),
                self.layout.cache_dir(),
            ]);
        }
        for dir in targets {
            if dir.exists() {
                info!("removing {}", dir.display());
                fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> Result<Status> {
        let image = self
            .layout
            .image_path(&self.manifest.name, &self.manifest.version);
        let sysroot = self.layout.sysroot_dir();
        Ok(Status {
            cache: self.cache.status()?,
            image: image.is_file().then_some(image),
            sysroot: sysroot.is_dir().then_some(sysroot),
        })
    }

    /// Boot the assembled image with the kernel and initrd it contains.
    /// `qemu_args` go to QEMU after the generated arguments.
    pub fn run_vm(&self, append: Option<&str>, qemu_args: &[String]) -> Result<()> {
        let image = self
            .layout
            .image_path(&self.manifest.name, &self.manifest.version);
        let boot = self.layout.sysroot_dir().join("boot");
        let initrd = boot.join("initramfs.img");
        let initrd = initrd.is_file().then_some(initrd);
        VmRunner::new(&self.layout, &self.config.vm)
            .with_firmware_download(&self.cache, &*self.fetcher, EDK2_OVMF)
            .run(
                &image,
                &boot.join("vmlinuz"),
                initrd.as_deref(),
                append,
                qemu_args,
            )
    }

    pub fn reset_vm(&self) -> Result<PathBuf> {
        VmRunner::new(&self.layout, &self.config.vm).reset()
    }
}
