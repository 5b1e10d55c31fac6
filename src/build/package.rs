//! Package build engine.
//!
//! `build` resolves the source, builds declared dependencies first, computes
//! the build fingerprint and returns the cached artifact when there is one.
//! Otherwise it runs the stage pipeline inside the cache producer:
//!
//! ```text
//! clean -> stage -> compile -> collect -> unpack -> publish
//! ```
//!
//! Binary sources skip `compile`; the fetched archive is collected directly.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use super::container::{
    dockerfile_context, ContainerInvocation, ExecutionContext, ImageBuild, Mount, DEPS_MOUNT,
};
use crate::artifact::filesystem::{copy_dir_recursive, unpack_archive};
use crate::cache::{ArtifactSet, ArtifactStaging, BuildCache};
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{digest_json, hash_dir, BuildFingerprint, SourceFingerprint, ToolchainIdentity};
use crate::layout::OutputLayout;
use crate::manifest::{Manifest, PackageSpec, SourceDescriptor};
use crate::source::{Fetcher, ResolvedSource, SourceResolver};

const MAKEPKG: &str = "makepkg --noconfirm --noprogressbar -s -C -f";

/// Everything besides the source that decides what a build produces.
#[derive(Serialize)]
struct PackageInputs<'a> {
    name: &'a str,
    version: &'a str,
    image: &'a str,
    pick: &'a Option<Vec<String>>,
    /// Dependency name to build fingerprint.
    deps: BTreeMap<&'a str, String>,
}

/// A built package plus the archives of its whole dependency closure.
struct Built {
    set: ArtifactSet,
    closure: Vec<PathBuf>,
}

/// Builds manifest packages through an [`ExecutionContext`].
pub struct PackageBuilder<'a> {
    cache: &'a BuildCache,
    resolver: SourceResolver<'a>,
    context: &'a dyn ExecutionContext,
    layout: &'a OutputLayout,
    manifest: &'a Manifest,
}

impl<'a> PackageBuilder<'a> {
    pub fn new(
        cache: &'a BuildCache,
        fetcher: &'a dyn Fetcher,
        context: &'a dyn ExecutionContext,
        layout: &'a OutputLayout,
        manifest: &'a Manifest,
    ) -> Self {
        Self {
            cache,
            resolver: SourceResolver::new(cache, fetcher),
            context,
            layout,
            manifest,
        }
    }

    /// Build one package (and, first, its declared dependencies).
    pub fn build(&self, spec: &PackageSpec) -> Result<ArtifactSet> {
        self.build_inner(spec).map(|b| b.set)
    }

    /// Build `names` on up to `jobs` worker threads.
    ///
    /// A failure never stops other builds. Results come back in the order of
    /// `names`.
    pub fn build_all(&self, names: &[&str], jobs: usize) -> Vec<(String, Result<ArtifactSet>)> {
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<Result<ArtifactSet>>>> =
            Mutex::new(names.iter().map(|_| None).collect());
        let workers = jobs.clamp(1, names.len().max(1));

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    let Some(name) = names.get(i) else { break };
                    let result = match self.manifest.package(name) {
                        Some(spec) => self.build(spec),
                        None => Err(Error::not_found("package", *name)),
                    };
                    if let Ok(mut slots) = slots.lock() {
                        slots[i] = Some(result);
                    }
                });
            }
        });

        let slots = slots.into_inner().unwrap_or_else(|e| e.into_inner());
        names
            .iter()
            .zip(slots)
            .map(|(name, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(Error::BuildStage {
                        package: name.to_string(),
                        stage: "schedule",
                        reason: "build worker exited without a result".to_string(),
                    })
                });
                (name.to_string(), result)
            })
            .collect()
    }

    /// Build fingerprint of `spec` without fetching or building anything.
    ///
    /// Returns the source fingerprints of the package and its dependencies
    /// alongside, for computing the cache's live set.
    pub fn plan(&self, spec: &PackageSpec) -> Result<(BuildFingerprint, Vec<SourceFingerprint>)> {
        let source = self.resolver.fingerprint(&spec.source)?;
        let mut sources = vec![source.clone()];
        let mut deps = BTreeMap::new();
        for dep in &spec.build.build_deps {
            let (fp, dep_sources) = self.plan(self.dependency(spec, dep)?)?;
            deps.insert(dep.as_str(), fp.to_string());
            sources.extend(dep_sources);
        }
        Ok((self.fingerprint(spec, &source, deps)?, sources))
    }

    fn dependency(&self, spec: &PackageSpec, dep: &str) -> Result<&'a PackageSpec> {
        self.manifest.package(dep).ok_or_else(|| {
            Error::not_found(format!("build dependency of '{}'", spec.name), dep)
        })
    }

    fn fingerprint(
        &self,
        spec: &PackageSpec,
        source: &SourceFingerprint,
        deps: BTreeMap<&str, String>,
    ) -> Result<BuildFingerprint> {
        let image = build_image(spec)?;
        let inputs = PackageInputs {
            name: &spec.name,
            version: &spec.version,
            image: &image,
            pick: &spec.build.pick,
            deps,
        };
        let toolchain = ToolchainIdentity::new(self.context.runtime(), &image);
        BuildFingerprint::compute(source, &inputs, &toolchain)
    }

    fn build_inner(&self, spec: &PackageSpec) -> Result<Built> {
        let resolved = self.resolver.resolve(spec)?;

        let mut deps = BTreeMap::new();
        let mut dep_archives: Vec<PathBuf> = Vec::new();
        for dep in &spec.build.build_deps {
            let built = self.build_inner(self.dependency(spec, dep)?)?;
            deps.insert(dep.as_str(), built.set.fingerprint.to_string());
            for archive in built.closure {
                if !dep_archives.contains(&archive) {
                    dep_archives.push(archive);
                }
            }
        }

        let fp = self.fingerprint(spec, &resolved.fingerprint, deps)?;
        let set = match self.cache.get_artifact(&fp)? {
            Some(set) => {
                info!("{}@{} up to date ({})", spec.name, spec.version, fp.short());
                set
            }
            None => {
                info!("building {}@{} ({})", spec.name, spec.version, fp.short());
                self.cache.put_artifact(&fp, &spec.name, |staging| {
                    self.run_stages(spec, &fp, &resolved, &dep_archives, staging)
                })?
            }
        };

        let mut closure = set.archives.clone();
        closure.extend(dep_archives);
        Ok(Built { set, closure })
    }

    fn run_stages(
        &self,
        spec: &PackageSpec,
        fp: &BuildFingerprint,
        resolved: &ResolvedSource,
        dep_archives: &[PathBuf],
        staging: &mut ArtifactStaging,
    ) -> Result<()> {
        let work = self.layout.work_dir(&spec.name);
        let stage_err = |stage: &'static str| {
            move |e: Error| Error::BuildStage {
                package: spec.name.clone(),
                stage,
                reason: e.to_string(),
            }
        };

        debug!("[{}] clean", spec.name);
        clean(&work).map_err(stage_err("clean"))?;

        let produced = match &spec.source {
            SourceDescriptor::Binary { .. } => fetched_files(&resolved.tree_path)?,
            SourceDescriptor::Git { .. } | SourceDescriptor::Pkgbuild { .. } => {
                debug!("[{}] stage", spec.name);
                stage(&work, resolved, dep_archives).map_err(stage_err("stage"))?;

                let image = build_image(spec)?;
                if let Some(dockerfile) = &spec.build.dockerfile {
                    debug!("[{}] image", spec.name);
                    let build = ImageBuild::new(
                        image.as_str(),
                        dockerfile,
                        format!("{}@{} | Dockerfile", spec.name, spec.version),
                    );
                    let code = self.context.build_image(&build)?;
                    if code != 0 {
                        return Err(Error::BuildStage {
                            package: spec.name.clone(),
                            stage: "image",
                            reason: format!("image build exited with code {code}"),
                        });
                    }
                }

                debug!("[{}] compile", spec.name);
                let exit_code = self.context.run(&makepkg_invocation(spec, &image, &work))?;
                if exit_code != 0 {
                    return Err(Error::Build {
                        package: spec.name.clone(),
                        exit_code,
                        fingerprint: fp.to_string(),
                    });
                }
                list_archives(&work.join("out"))?
            }
        };

        debug!("[{}] collect", spec.name);
        let kept = select_archives(spec, &produced);
        if kept.is_empty() {
            return Err(Error::BuildStage {
                package: spec.name.clone(),
                stage: "collect",
                reason: "no package archives produced".to_string(),
            });
        }
        let mut collected = Vec::with_capacity(kept.len());
        for archive in &kept {
            let dest = staging.archives.join(archive_name(spec, archive));
            fs::copy(archive, &dest).io_context(|| format!("collecting {}", archive.display()))?;
            collected.push(dest);
        }

        debug!("[{}] unpack", spec.name);
        for archive in &collected {
            unpack_archive(archive, &staging.root).map_err(stage_err("unpack"))?;
        }
        let unpacked = fs::read_dir(&staging.root)
            .io_context(|| format!("reading {}", staging.root.display()))?
            .next()
            .is_some();
        if !unpacked {
            return Err(Error::BuildStage {
                package: spec.name.clone(),
                stage: "unpack",
                reason: "package archives contained no files".to_string(),
            });
        }

        staging.meta.insert("version".into(), spec.version.clone());
        staging.meta.insert("source".into(), spec.source.kind().into());

        if work.exists() {
            fs::remove_dir_all(&work).io_context(|| format!("removing {}", work.display()))?;
        }
        Ok(())
    }
}

fn clean(work: &Path) -> Result<()> {
    if work.exists() {
        fs::remove_dir_all(work).io_context(|| format!("removing {}", work.display()))?;
    }
    for dir in ["src", "out", "deps"] {
        let path = work.join(dir);
        fs::create_dir_all(&path).io_context(|| format!("creating {}", path.display()))?;
    }
    Ok(())
}

fn stage(work: &Path, resolved: &ResolvedSource, dep_archives: &[PathBuf]) -> Result<()> {
    copy_dir_recursive(&resolved.tree_path, &work.join("src"))?;
    for archive in dep_archives {
        let dest = work.join("deps").join(file_name(archive));
        fs::copy(archive, &dest).io_context(|| format!("staging {}", archive.display()))?;
    }
    Ok(())
}

/// Image a package builds in: `build.image`, or a tag derived from the
/// Dockerfile's build context so edits there produce a new image.
fn build_image(spec: &PackageSpec) -> Result<String> {
    let Some(dockerfile) = &spec.build.dockerfile else {
        return Ok(spec.build.image.clone());
    };
    if !dockerfile.is_file() {
        return Err(Error::not_found(
            format!("Dockerfile for '{}'", spec.name),
            dockerfile.display().to_string(),
        ));
    }
    let context = hash_dir(&dockerfile_context(dockerfile))?;
    let digest = digest_json("dockerfile", &(file_name(dockerfile), context))?;
    let repo: String = spec
        .name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '-' })
        .collect();
    Ok(format!("osforge-build/{repo}:{}", &digest[..16]))
}

fn makepkg_invocation(spec: &PackageSpec, image: &str, work: &Path) -> ContainerInvocation {
    ContainerInvocation::new(
        format!("{}@{} | makepkg", spec.name, spec.version),
        image,
        MAKEPKG,
    )
    .mount(Mount::rw(work.join("src"), "/src"))
    .mount(Mount::rw(work.join("out"), "/out"))
    .mount(Mount::ro(work.join("deps"), DEPS_MOUNT))
    .env("PKGDEST", "/out")
    .env("BUILDDIR", "/out/makepkg")
    .workdir("/src")
}

/// Package archives directly inside `dir`, sorted by name.
fn list_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(dir).io_context(|| format!("reading {}", dir.display()))? {
        let ent = ent.io_context(|| format!("reading {}", dir.display()))?;
        let path = ent.path();
        if path.is_file() && file_name(&path).contains(".pkg.tar") {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Every regular file the resolver fetched for a binary source.
///
/// The download is a package archive whatever its URL called it.
fn fetched_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for ent in fs::read_dir(dir).io_context(|| format!("reading {}", dir.display()))? {
        let ent = ent.io_context(|| format!("reading {}", dir.display()))?;
        let path = ent.path();
        if path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Name an archive is collected under. Downloads from URLs such as
/// `.../<pkg>/download/` get `<name>-<version>.pkg.tar.zst`, so pacman and
/// `/deps` staging still recognize them.
fn archive_name(spec: &PackageSpec, archive: &Path) -> String {
    let name = file_name(archive);
    if name.contains(".pkg.tar") {
        name
    } else {
        format!("{}-{}.pkg.tar.zst", spec.name, spec.version)
    }
}

/// Apply `pick`, or drop the package's debug archive when there is none.
fn select_archives(spec: &PackageSpec, produced: &[PathBuf]) -> Vec<PathBuf> {
    if matches!(spec.source, SourceDescriptor::Binary { .. }) {
        return produced.to_vec();
    }
    produced
        .iter()
        .filter(|path| {
            let name = file_name(path);
            match &spec.build.pick {
                Some(picked) => picked
                    .iter()
                    .any(|p| name.starts_with(&format!("{}-{}-", p, spec.version))),
                None => !name.starts_with(&format!("{}-debug-{}-", spec.name, spec.version)),
            }
        })
        .cloned()
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::testing::write_pkg;
    use super::*;
    use crate::build::container::testing::FakeContext;
    use crate::source::testing::FakeFetcher;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        layout: OutputLayout,
        cache: BuildCache,
        fetcher: FakeFetcher,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            let layout = OutputLayout::new(tmp.path().join("build"));
            let cache = BuildCache::open(&layout.cache_dir()).unwrap();
            Self {
                tmp,
                layout,
                cache,
                fetcher: FakeFetcher::default(),
            }
        }

        fn pkgbuild(&self, name: &str, body: &str) {
            let dir = self.tmp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("PKGBUILD"), body).unwrap();
        }

        fn manifest(&self, text: &str) -> Manifest {
            Manifest::parse(text, self.tmp.path()).unwrap()
        }
    }

    /// Emulates makepkg: writes `<name>-1.0-1-x86_64.pkg.tar.zst` for every
    /// name listed in the PKGBUILD's `pkgname=` line.
    fn makepkg_ok() -> FakeContext {
        FakeContext::new(|inv| {
            let src = inv.host_path("/src").unwrap();
            let out = inv.host_path("/out").unwrap();
            let pkgbuild = fs::read_to_string(src.join("PKGBUILD")).unwrap();
            let names = pkgbuild
                .lines()
                .find_map(|l| l.strip_prefix("pkgname="))
                .unwrap_or("hello");
            for name in names.split(',') {
                let bin = format!("usr/bin/{name}");
                write_pkg(
                    &out.join(format!("{name}-1.0-1-x86_64.pkg.tar.zst")),
                    name,
                    &[(bin.as_str(), "#!/bin/sh\n")],
                );
            }
            Ok(0)
        })
    }

    const HELLO: &str = r#"
version = "0.1.0"
[[package]]
name = "hello"
version = "1.0"
source = { kind = "pkgbuild", local_path = "hello" }
"#;

    #[test]
    fn second_build_is_a_cache_hit() {
        let fx = Fixture::new();
        fx.pkgbuild("hello", "pkgname=hello\n");
        let manifest = fx.manifest(HELLO);
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);
        let spec = manifest.package("hello").unwrap();

        let first = builder.build(spec).unwrap();
        let second = builder.build(spec).unwrap();

        assert_eq!(ctx.calls(), 1);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(first.files.contains(&PathBuf::from("usr/bin/hello")));
        assert!(first.root.join("usr/bin/hello").is_file());
        assert!(!fx.layout.work_dir("hello").exists());

        let inv = &ctx.seen.lock().unwrap()[0];
        assert_eq!(inv.tag, "hello@1.0 | makepkg");
        assert!(inv.env.contains(&("PKGDEST".to_string(), "/out".to_string())));
    }

    #[test]
    fn concurrent_builds_of_one_fingerprint_run_once() {
        let fx = Fixture::new();
        fx.pkgbuild("hello", "pkgname=hello\n");
        let manifest = fx.manifest(HELLO);
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);
        let spec = manifest.package("hello").unwrap();

        let fps: Vec<BuildFingerprint> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| builder.build(spec).unwrap().fingerprint))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(ctx.calls(), 1);
        assert!(fps.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn failure_names_package_and_leaves_no_entry() {
        let fx = Fixture::new();
        fx.pkgbuild("hello", "pkgname=hello\n");
        fx.pkgbuild("other", "pkgname=other\n");
        let manifest = fx.manifest(&format!(
            "{HELLO}\n[[package]]\nname = \"other\"\nversion = \"1.0\"\nsource = {{ kind = \"pkgbuild\", local_path = \"other\" }}\n"
        ));
        let ctx = FakeContext::new(|inv| {
            if inv.tag.starts_with("hello@") {
                return Ok(2);
            }
            let out = inv.host_path("/out").unwrap();
            write_pkg(&out.join("other-1.0-1-x86_64.pkg.tar.zst"), "other", &[("etc/other", "x")]);
            Ok(0)
        });
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);

        let results = builder.build_all(&["hello", "other"], 2);
        assert_eq!(results[0].0, "hello");
        match &results[0].1 {
            Err(Error::Build {
                package, exit_code, ..
            }) => {
                assert_eq!(package, "hello");
                assert_eq!(*exit_code, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(results[1].1.is_ok());

        let (fp, _) = builder.plan(manifest.package("hello").unwrap()).unwrap();
        assert!(fx.cache.get_artifact(&fp).unwrap().is_none());
    }

    #[test]
    fn debug_archives_are_dropped_and_pick_selects() {
        let fx = Fixture::new();
        fx.pkgbuild("hello", "pkgname=hello,hello-debug\n");
        fx.pkgbuild("group", "pkgname=a,b\n");
        let manifest = fx.manifest(&format!(
            "{HELLO}\n[[package]]\nname = \"group\"\nversion = \"1.0\"\nsource = {{ kind = \"pkgbuild\", local_path = \"group\" }}\nbuild = {{ pick = [\"b\"] }}\n"
        ));
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);

        let hello = builder.build(manifest.package("hello").unwrap()).unwrap();
        let names: Vec<String> = hello.archives.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["hello-1.0-1-x86_64.pkg.tar.zst"]);

        let group = builder.build(manifest.package("group").unwrap()).unwrap();
        assert!(group.root.join("usr/bin/b").exists());
        assert!(!group.root.join("usr/bin/a").exists());
    }

    #[test]
    fn dependencies_are_built_first_and_mounted() {
        let fx = Fixture::new();
        fx.pkgbuild("lib", "pkgname=lib\n");
        fx.pkgbuild("app", "pkgname=app\n");
        let text = r#"
version = "0.1.0"
[[package]]
name = "app"
version = "1.0"
source = { kind = "pkgbuild", local_path = "app" }
build = { build_deps = ["lib"] }
[[package]]
name = "lib"
version = "1.0"
source = { kind = "pkgbuild", local_path = "lib" }
"#;
        let manifest = fx.manifest(text);
        let ctx = FakeContext::new(|inv| {
            let deps = inv.host_path(DEPS_MOUNT).unwrap();
            let out = inv.host_path("/out").unwrap();
            if inv.tag.starts_with("app@") {
                assert!(deps.join("lib-1.0-1-x86_64.pkg.tar.zst").is_file());
                write_pkg(&out.join("app-1.0-1-x86_64.pkg.tar.zst"), "app", &[("usr/bin/app", "")]);
            } else {
                write_pkg(&out.join("lib-1.0-1-x86_64.pkg.tar.zst"), "lib", &[("usr/lib/lib.so", "")]);
            }
            Ok(0)
        });
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);
        let app = manifest.package("app").unwrap();
        let before = builder.build(app).unwrap();
        assert_eq!(ctx.calls(), 2);

        fs::write(fx.tmp.path().join("lib/PKGBUILD"), "pkgname=lib\n# v2\n").unwrap();
        let (after, _) = builder.plan(app).unwrap();
        assert_ne!(before.fingerprint, after);
    }

    #[test]
    fn binary_sources_skip_compile() {
        let fx = Fixture::new();
        let url = "https://example.org/tool-2.0-1-x86_64.pkg.tar.zst";
        let archive = fx.tmp.path().join("tool.pkg.tar.zst");
        write_pkg(&archive, "tool", &[("usr/bin/tool", "")]);
        fx.fetcher.serve(url, fs::read(&archive).unwrap());
        let manifest = fx.manifest(&format!(
            "version = \"0.1.0\"\n[[package]]\nname = \"tool\"\nversion = \"2.0\"\nsource = {{ kind = \"binary\", url = \"{url}\" }}\n"
        ));
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);

        let set = builder.build(manifest.package("tool").unwrap()).unwrap();
        assert_eq!(ctx.calls(), 0);
        assert!(set.root.join("usr/bin/tool").exists());
        assert_eq!(set.meta.get("source").map(String::as_str), Some("binary"));
    }

    #[test]
    fn binary_download_urls_without_archive_names() {
        let fx = Fixture::new();
        let url = "https://archlinux.org/packages/extra/any/tool/download/";
        let archive = fx.tmp.path().join("tool.pkg.tar.zst");
        write_pkg(&archive, "tool", &[("usr/bin/tool", "")]);
        fx.fetcher.serve(url, fs::read(&archive).unwrap());
        let manifest = fx.manifest(&format!(
            "version = \"0.1.0\"\n[[package]]\nname = \"tool\"\nversion = \"2.0\"\nsource = {{ kind = \"binary\", url = \"{url}\" }}\n"
        ));
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);

        let set = builder.build(manifest.package("tool").unwrap()).unwrap();
        assert!(set.root.join("usr/bin/tool").exists());
        let names: Vec<String> = set.archives.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, ["tool-2.0.pkg.tar.zst"]);
    }

    #[test]
    fn dockerfile_image_is_built_before_compile() {
        let fx = Fixture::new();
        fx.pkgbuild("hello", "pkgname=hello\n");
        let docker = fx.tmp.path().join("docker");
        fs::create_dir_all(&docker).unwrap();
        fs::write(docker.join("Dockerfile"), "FROM archlinux:base-devel\n").unwrap();
        let manifest = fx.manifest(&format!("{HELLO}build = {{ dockerfile = \"docker/Dockerfile\" }}\n"));
        let ctx = makepkg_ok();
        let builder = PackageBuilder::new(&fx.cache, &fx.fetcher, &ctx, &fx.layout, &manifest);
        let spec = manifest.package("hello").unwrap();

        let before = builder.build(spec).unwrap();
        let images = ctx.images.lock().unwrap().clone();
        assert_eq!(images.len(), 1);
        assert!(images[0].tag.starts_with("osforge-build/hello:"));
        assert_eq!(images[0].context, docker);
        assert_eq!(ctx.seen.lock().unwrap()[0].image, images[0].tag);

        fs::write(docker.join("Dockerfile"), "FROM archlinux:base-devel\nRUN true\n").unwrap();
        let (after, _) = builder.plan(spec).unwrap();
        assert_ne!(before.fingerprint, after);
    }
}
