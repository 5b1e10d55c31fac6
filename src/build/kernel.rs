//! Kernel building.
//!
//! Builds an x86_64 Linux kernel from a release tarball inside the execution
//! context:
//!
//! ```text
//! resolve -> extract -> defconfig -> apply -> regenerate -> verify -> compile -> install
//! ```
//!
//! `apply` and `verify` run on the host against the generated `.config`.
//! Options the kernel's dependency resolution overrides are reported as
//! [`ConfigOptionWarning`]s and never fail the build.
//!
//! The result is cached like a package artifact; an unchanged kernel spec
//! never rebuilds.
//!
//! ```rust,ignore
//! let builder = KernelBuilder::new(&cache, &fetcher, &context, &layout, "archlinux:base-devel", 8);
//! let kernel = builder.build(manifest.kernel.as_ref().unwrap())?;
//! println!("{}", kernel.image_path.display()); // build/kernel/vmlinuz-6.9.1
//! ```

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::container::{ContainerInvocation, ExecutionContext, Mount};
use crate::artifact::filesystem::atomic_move;
use crate::cache::{ArtifactStaging, BuildCache};
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{BuildFingerprint, SourceFingerprint, ToolchainIdentity};
use crate::layout::OutputLayout;
use crate::manifest::KernelSpec;
use crate::source::{Fetcher, ResolvedSource, SourceResolver};

const KERNEL_PACKAGE: &str = "kernel";
const WORK_MOUNT: &str = "/kernel/work";
const DOWNLOADS_MOUNT: &str = "/kernel/downloads";

/// Canonical option name: no `CONFIG_` prefix, uppercase, `-` and `.` as `_`.
pub fn normalize_option_name(name: &str) -> String {
    let trimmed = name.trim();
    let upper = trimmed.to_ascii_uppercase();
    let bare = upper.strip_prefix("CONFIG_").unwrap_or(&upper);
    bare.replace(['-', '.'], "_")
}

/// `.config` line for an option.
pub fn render_option(name: &str, enabled: bool) -> String {
    let symbol = format!("CONFIG_{}", normalize_option_name(name));
    if enabled {
        format!("{symbol}=y")
    } else {
        format!("# {symbol} is not set")
    }
}

/// Merge options into an existing `.config`, replacing any line that already
/// sets the same symbol.
pub fn apply_kernel_config(config_path: &Path, options: &BTreeMap<String, bool>) -> Result<()> {
    let mut config = if config_path.exists() {
        fs::read_to_string(config_path)
            .io_context(|| format!("reading kernel config {}", config_path.display()))?
    } else {
        String::new()
    };

    for (name, enabled) in options {
        let symbol = format!("CONFIG_{}", normalize_option_name(name));
        let pattern = format!("{symbol}=");
        let pattern_not = format!("# {symbol} is not set");
        let mut kept: Vec<&str> = config
            .lines()
            .filter(|l| !l.starts_with(&pattern) && *l != pattern_not)
            .collect();
        let rendered = render_option(name, *enabled);
        kept.push(&rendered);
        config = kept.join("\n");
        config.push('\n');
    }

    fs::write(config_path, config)
        .io_context(|| format!("writing kernel config {}", config_path.display()))
}

/// A requested option the regenerated configuration does not honor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOptionWarning {
    pub option: String,
    pub requested: bool,
    /// Value in the final `.config`, `None` when unset.
    pub actual: Option<String>,
}

impl fmt::Display for ConfigOptionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requested = if self.requested { "y" } else { "n" };
        match &self.actual {
            Some(v) => write!(
                f,
                "CONFIG_{} requested {} but resolved to {}",
                self.option, requested, v
            ),
            None => write!(
                f,
                "CONFIG_{} requested {} but is not set",
                self.option, requested
            ),
        }
    }
}

/// Compare requested options with the final `.config`.
///
/// `=y` and `=m` count as enabled; absent or `is not set` as disabled.
pub fn verify_kernel_config(
    config_path: &Path,
    options: &BTreeMap<String, bool>,
) -> Result<Vec<ConfigOptionWarning>> {
    let config = fs::read_to_string(config_path)
        .io_context(|| format!("reading kernel config {}", config_path.display()))?;
    let mut values = BTreeMap::new();
    for line in config.lines() {
        if let Some((key, value)) = line.split_once('=') {
            if let Some(name) = key.strip_prefix("CONFIG_") {
                values.insert(name.to_string(), value.to_string());
            }
        }
    }

    let mut warnings = Vec::new();
    for (name, requested) in options {
        let option = normalize_option_name(name);
        let actual = values.get(&option).cloned();
        let enabled = matches!(actual.as_deref(), Some("y") | Some("m"));
        if enabled != *requested {
            warnings.push(ConfigOptionWarning {
                option,
                requested: *requested,
                actual,
            });
        }
    }
    Ok(warnings)
}

/// Get the kernel release from a configured source tree.
pub fn get_kernel_version(build_dir: &Path) -> Result<String> {
    let release_path = build_dir.join("include/config/kernel.release");
    if release_path.exists() {
        return Ok(fs::read_to_string(&release_path)
            .io_context(|| format!("reading {}", release_path.display()))?
            .trim()
            .to_string());
    }

    let makefile = build_dir.join("Makefile");
    if makefile.exists() {
        let content =
            fs::read_to_string(&makefile).io_context(|| format!("reading {}", makefile.display()))?;
        let mut version = String::new();
        let mut patchlevel = String::new();
        let mut sublevel = String::new();
        let mut extraversion = String::new();

        for line in content.lines() {
            if let Some(v) = line.strip_prefix("VERSION = ") {
                version = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("PATCHLEVEL = ") {
                patchlevel = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("SUBLEVEL = ") {
                sublevel = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("EXTRAVERSION = ") {
                extraversion = v.trim().to_string();
            }
        }

        if !version.is_empty() && !patchlevel.is_empty() {
            return Ok(format!("{version}.{patchlevel}.{sublevel}{extraversion}"));
        }
    }

    Err(Error::Kernel {
        stage: "install",
        reason: format!("could not determine kernel release in {}", build_dir.display()),
    })
}

/// A built kernel.
#[derive(Debug, Clone)]
pub struct KernelArtifact {
    pub fingerprint: BuildFingerprint,
    /// `uname -r` of the built kernel.
    pub release: String,
    /// Stable copy at `kernel/vmlinuz-<release>`.
    pub image_path: PathBuf,
    /// Directory holding `<release>/` module trees.
    pub modules_path: PathBuf,
    pub warnings: Vec<ConfigOptionWarning>,
}

#[derive(Serialize)]
struct KernelInputs<'a> {
    options: BTreeMap<String, bool>,
    version: &'a Option<String>,
    arch: &'static str,
}

pub struct KernelBuilder<'a> {
    cache: &'a BuildCache,
    resolver: SourceResolver<'a>,
    context: &'a dyn ExecutionContext,
    layout: &'a OutputLayout,
    image: String,
    jobs: usize,
}

impl<'a> KernelBuilder<'a> {
    pub fn new(
        cache: &'a BuildCache,
        fetcher: &'a dyn Fetcher,
        context: &'a dyn ExecutionContext,
        layout: &'a OutputLayout,
        image: impl Into<String>,
        jobs: usize,
    ) -> Self {
        Self {
            cache,
            resolver: SourceResolver::new(cache, fetcher),
            context,
            layout,
            image: image.into(),
            jobs: jobs.max(1),
        }
    }

    /// Fingerprint of the kernel build without fetching anything.
    pub fn plan(&self, spec: &KernelSpec) -> Result<BuildFingerprint> {
        let source = self.resolver.fingerprint(&spec.source())?;
        self.fingerprint(spec, &source)
    }

    fn fingerprint(
        &self,
        spec: &KernelSpec,
        source: &SourceFingerprint,
    ) -> Result<BuildFingerprint> {
        let inputs = KernelInputs {
            options: spec
                .options
                .iter()
                .map(|(k, v)| (normalize_option_name(k), *v))
                .collect(),
            version: &spec.version,
            arch: "x86_64",
        };
        let toolchain = ToolchainIdentity::new(self.context.runtime(), &self.image);
        BuildFingerprint::compute(source, &inputs, &toolchain)
    }

    pub fn build(&self, spec: &KernelSpec) -> Result<KernelArtifact> {
        let resolved = self
            .resolver
            .resolve_descriptor(&spec.source())
            .map_err(|e| match e {
                e @ (Error::Integrity { .. } | Error::NotFound { .. } | Error::Fetch { .. }) => e,
                other => Error::Kernel {
                    stage: "resolve",
                    reason: other.to_string(),
                },
            })?;
        let fp = self.fingerprint(spec, &resolved.fingerprint)?;

        let set = match self.cache.get_artifact(&fp)? {
            Some(set) => {
                info!("kernel up to date ({})", fp.short());
                set
            }
            None => {
                info!("building kernel ({})", fp.short());
                self.cache.put_artifact(&fp, KERNEL_PACKAGE, |staging| {
                    self.run_stages(spec, &resolved, staging)
                })?
            }
        };

        let release = set.meta.get("release").cloned().ok_or_else(|| Error::Kernel {
            stage: "install",
            reason: "cached kernel has no release recorded".to_string(),
        })?;
        let warnings = verify_kernel_config(&set.root.join("config"), &spec.options)?;
        for w in &warnings {
            warn!("kernel config: {}", w);
        }

        let image_path = self.layout.kernel_image_path(&release);
        fs::create_dir_all(self.layout.kernel_dir())
            .io_context(|| format!("creating {}", self.layout.kernel_dir().display()))?;
        let partial = image_path.with_file_name(format!(".vmlinuz-{release}.partial"));
        fs::copy(set.root.join("vmlinuz"), &partial)
            .io_context(|| format!("installing {}", image_path.display()))?;
        atomic_move(&partial, &image_path)?;
        info!("kernel {} at {}", release, image_path.display());

        Ok(KernelArtifact {
            fingerprint: fp,
            release,
            image_path,
            modules_path: set.root.join("modules"),
            warnings,
        })
    }

    fn run_stages(
        &self,
        spec: &KernelSpec,
        resolved: &ResolvedSource,
        staging: &mut ArtifactStaging,
    ) -> Result<()> {
        let work = self.layout.work_root().join(".kernel");
        if work.exists() {
            fs::remove_dir_all(&work).io_context(|| format!("removing {}", work.display()))?;
        }
        for dir in ["src", "modroot"] {
            fs::create_dir_all(work.join(dir))
                .io_context(|| format!("creating {}", work.display()))?;
        }
        let src = work.join("src");
        let config = src.join(".config");

        let tarball = tarball_name(&resolved.tree_path)?;
        self.step(
            "extract",
            &work,
            resolved,
            &format!(
                "tar -xf {DOWNLOADS_MOUNT}/{} -C {WORK_MOUNT}/src --strip-components=1",
                super::container::sh_quote(&tarball)
            ),
        )?;

        self.step("defconfig", &work, resolved, "make x86_64_defconfig")?;

        debug!("kernel: applying {} option(s)", spec.options.len());
        apply_kernel_config(&config, &spec.options).map_err(|e| Error::Kernel {
            stage: "apply",
            reason: e.to_string(),
        })?;

        self.step("regenerate", &work, resolved, "make olddefconfig")?;

        for w in verify_kernel_config(&config, &spec.options)? {
            warn!("kernel config: {}", w);
        }

        let jobs = self.jobs;
        self.step(
            "compile",
            &work,
            resolved,
            &format!(
                "make -j{jobs} bzImage modules\nmake modules_install INSTALL_MOD_PATH={WORK_MOUNT}/modroot"
            ),
        )?;

        // install
        let release = get_kernel_version(&src)?;
        let bz_image = src.join("arch/x86/boot/bzImage");
        if !bz_image.is_file() {
            return Err(Error::Kernel {
                stage: "install",
                reason: format!("{} not produced", bz_image.display()),
            });
        }
        fs::copy(&bz_image, staging.root.join("vmlinuz"))
            .io_context(|| format!("copying {}", bz_image.display()))?;
        fs::copy(&config, staging.root.join("config"))
            .io_context(|| format!("copying {}", config.display()))?;

        let built_modules = work.join("modroot/lib/modules").join(&release);
        let modules = staging.root.join("modules");
        fs::create_dir_all(&modules).io_context(|| format!("creating {}", modules.display()))?;
        if built_modules.is_dir() {
            let dest = modules.join(&release);
            fs::rename(&built_modules, &dest)
                .io_context(|| format!("moving {}", built_modules.display()))?;
            // Links back into the build tree are dangling once it is gone.
            for link in ["source", "build"] {
                remove_if_present(&dest.join(link))?;
            }
        } else {
            warn!("kernel {} installed no modules", release);
        }

        staging.meta.insert("release".into(), release);
        if let Some(version) = &spec.version {
            staging.meta.insert("version".into(), version.clone());
        }

        fs::remove_dir_all(&work).io_context(|| format!("removing {}", work.display()))
    }

    fn step(&self, stage: &'static str, work: &Path, resolved: &ResolvedSource, script: &str) -> Result<()> {
        debug!("kernel: {}", stage);
        let invocation = ContainerInvocation::new(format!("kernel | {stage}"), &self.image, script)
            .mount(Mount::ro(&resolved.tree_path, DOWNLOADS_MOUNT))
            .mount(Mount::rw(work, WORK_MOUNT))
            .env("MAKEFLAGS", format!("-j{}", self.jobs))
            .workdir(format!("{WORK_MOUNT}/src"));
        let code = self.context.run(&invocation).map_err(|e| Error::Kernel {
            stage,
            reason: e.to_string(),
        })?;
        if code != 0 {
            return Err(Error::Kernel {
                stage,
                reason: format!("exited with code {code}"),
            });
        }
        Ok(())
    }
}

/// Remove a file or symlink. A missing path is fine.
fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(Error::io(format!("removing {}", path.display()), e))
        }
        _ => Ok(()),
    }
}

/// The single file the resolver placed in the tarball's source tree.
fn tarball_name(tree: &Path) -> Result<String> {
    for ent in fs::read_dir(tree).io_context(|| format!("reading {}", tree.display()))? {
        let ent = ent.io_context(|| format!("reading {}", tree.display()))?;
        if ent.path().is_file() {
            return Ok(ent.file_name().to_string_lossy().into_owned());
        }
    }
    Err(Error::Kernel {
        stage: "extract",
        reason: format!("no kernel tarball in {}", tree.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::container::testing::FakeContext;
    use crate::source::testing::FakeFetcher;
    use tempfile::TempDir;

    fn options(pairs: &[(&str, bool)]) -> BTreeMap<String, bool> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn names_are_normalized() {
        assert_eq!(normalize_option_name("CONFIG_serial-core"), "SERIAL_CORE");
        assert_eq!(normalize_option_name("ext4.fs"), "EXT4_FS");
        assert_eq!(render_option("VT", false), "# CONFIG_VT is not set");
        assert_eq!(render_option("serial_core", true), "CONFIG_SERIAL_CORE=y");
    }

    #[test]
    fn apply_replaces_existing_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".config");
        fs::write(
            &config_path,
            "CONFIG_FOO=y\n# CONFIG_SERIAL_CORE is not set\nCONFIG_VT=y\nCONFIG_VT_CONSOLE=y\n",
        )
        .unwrap();

        apply_kernel_config(&config_path, &options(&[("SERIAL_CORE", true), ("VT", false)]))
            .unwrap();

        let result = fs::read_to_string(&config_path).unwrap();
        assert!(result.contains("CONFIG_FOO=y"));
        assert!(result.contains("CONFIG_SERIAL_CORE=y\n"));
        assert!(result.contains("# CONFIG_VT is not set\n"));
        assert!(result.contains("CONFIG_VT_CONSOLE=y"));
        assert_eq!(result.matches("CONFIG_SERIAL_CORE").count(), 1);
        assert_eq!(result.matches("CONFIG_VT=").count(), 0);
    }

    #[test]
    fn verify_reports_overridden_options() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".config");
        fs::write(&config_path, "CONFIG_SERIAL_CORE=m\nCONFIG_VT=y\n").unwrap();

        let warnings = verify_kernel_config(
            &config_path,
            &options(&[("SERIAL_CORE", true), ("VT", false), ("EXT4_FS", true)]),
        )
        .unwrap();

        assert_eq!(
            warnings,
            vec![
                ConfigOptionWarning {
                    option: "EXT4_FS".into(),
                    requested: true,
                    actual: None,
                },
                ConfigOptionWarning {
                    option: "VT".into(),
                    requested: false,
                    actual: Some("y".into()),
                },
            ]
        );
    }

    #[test]
    fn release_falls_back_to_makefile() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("Makefile"),
            "VERSION = 6\nPATCHLEVEL = 9\nSUBLEVEL = 1\nEXTRAVERSION =\n",
        )
        .unwrap();
        assert_eq!(get_kernel_version(tmp.path()).unwrap(), "6.9.1");
    }

    const URL: &str = "https://cdn.example.org/linux-6.9.1.tar.xz";

    /// Plays the kernel build system against the mounted work directory.
    fn fake_kbuild() -> FakeContext {
        FakeContext::new(|inv| {
            let src = inv.host_path(WORK_MOUNT).unwrap().join("src");
            let work = inv.host_path(WORK_MOUNT).unwrap().to_path_buf();
            match inv.tag.as_str() {
                "kernel | extract" => {
                    assert!(inv.script.contains("linux-6.9.1.tar.xz"));
                    fs::write(src.join("Makefile"), "VERSION = 6\nPATCHLEVEL = 9\nSUBLEVEL = 1\n")
                        .unwrap();
                }
                "kernel | defconfig" => {
                    fs::write(src.join(".config"), "CONFIG_VT=y\n# CONFIG_SERIAL_CORE is not set\n")
                        .unwrap();
                }
                "kernel | regenerate" => {
                    // Dependency resolution turns VT back on.
                    let config = fs::read_to_string(src.join(".config")).unwrap();
                    fs::write(src.join(".config"), config.replace("# CONFIG_VT is not set", "CONFIG_VT=y"))
                        .unwrap();
                }
                "kernel | compile" => {
                    fs::create_dir_all(src.join("arch/x86/boot")).unwrap();
                    fs::write(src.join("arch/x86/boot/bzImage"), "bz").unwrap();
                    let modules = work.join("modroot/lib/modules/6.9.1/kernel");
                    fs::create_dir_all(&modules).unwrap();
                    fs::write(modules.join("virtio.ko"), "ko").unwrap();
                    std::os::unix::fs::symlink(&src, work.join("modroot/lib/modules/6.9.1/build"))
                        .unwrap();
                }
                other => panic!("unexpected step {other}"),
            }
            Ok(0)
        })
    }

    #[test]
    fn unchanged_spec_builds_once() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path().join("build"));
        let cache = BuildCache::open(&layout.cache_dir()).unwrap();
        let fetcher = FakeFetcher::default();
        fetcher.serve(URL, "tarball");
        let ctx = fake_kbuild();
        let builder = KernelBuilder::new(&cache, &fetcher, &ctx, &layout, "archlinux:base-devel", 4);
        let spec = KernelSpec {
            url: URL.to_string(),
            checksum: None,
            options: options(&[("SERIAL_CORE", true), ("VT", false)]),
            version: None,
        };

        let first = builder.build(&spec).unwrap();
        assert_eq!(ctx.calls(), 4);
        assert_eq!(first.release, "6.9.1");
        assert_eq!(first.image_path, layout.kernel_dir().join("vmlinuz-6.9.1"));
        assert_eq!(fs::read_to_string(&first.image_path).unwrap(), "bz");
        assert!(first.modules_path.join("6.9.1/kernel/virtio.ko").is_file());
        assert!(fs::symlink_metadata(first.modules_path.join("6.9.1/build")).is_err());
        assert_eq!(first.warnings.len(), 1);
        assert_eq!(first.warnings[0].option, "VT");

        let second = builder.build(&spec).unwrap();
        assert_eq!(ctx.calls(), 4);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(fetcher.calls(), 1);

        let seen = ctx.seen.lock().unwrap();
        assert!(seen[3].script.contains("make -j4 bzImage modules"));
        assert!(seen[3]
            .env
            .contains(&("MAKEFLAGS".to_string(), "-j4".to_string())));
    }

    #[test]
    fn failed_step_names_the_stage() {
        let tmp = TempDir::new().unwrap();
        let layout = OutputLayout::new(tmp.path().join("build"));
        let cache = BuildCache::open(&layout.cache_dir()).unwrap();
        let fetcher = FakeFetcher::default();
        fetcher.serve(URL, "tarball");
        let ctx = FakeContext::new(|inv| Ok(if inv.tag == "kernel | defconfig" { 2 } else { 0 }));
        let builder = KernelBuilder::new(&cache, &fetcher, &ctx, &layout, "img", 1);
        let spec = KernelSpec {
            url: URL.to_string(),
            checksum: None,
            options: BTreeMap::new(),
            version: None,
        };

        let err = builder.build(&spec).unwrap_err();
        assert!(matches!(err, Error::Kernel { stage: "defconfig", .. }));
        assert!(cache.get_artifact(&builder.plan(&spec).unwrap()).unwrap().is_none());
    }

    #[test]
    fn removing_links_propagates_real_errors() {
        let tmp = TempDir::new().unwrap();
        remove_if_present(&tmp.path().join("absent")).unwrap();

        let dir = tmp.path().join("build");
        fs::create_dir(&dir).unwrap();
        assert!(matches!(remove_if_present(&dir), Err(Error::Io { .. })));
        assert!(dir.is_dir());
    }
}
