//! Isolated execution of build steps.
//!
//! Package and kernel builds never run on the host. They go through an
//! [`ExecutionContext`], whose container contract is:
//!
//! - the step runs as the unprivileged `builder` user;
//! - `builder` may run `pacman` through `sudo` without a password, and nothing else;
//! - only the variables in [`ENV_ALLOW_LIST`] reach the step;
//! - archives mounted under `/deps` are installed with `pacman -U` first;
//! - writable mounts are handed back to the owner of their host directory afterwards.
//!
//! Output is streamed into the log line by line under the invocation's tag.
//! Packages may bring their own build image as a Dockerfile; it is built with
//! `<runtime> build` once per tag and process.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;

/// Environment variables a build step may receive.
pub const ENV_ALLOW_LIST: &[&str] = &["PKGDEST", "BUILDDIR", "MAKEFLAGS"];

/// Mount point for dependency archives inside the container.
pub const DEPS_MOUNT: &str = "/deps";

const BUILD_USER: &str = "builder";

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn ro(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }
}

/// One step to run in isolation.
#[derive(Debug, Clone)]
pub struct ContainerInvocation {
    /// Log prefix, e.g. `hello@1.0 | makepkg`.
    pub tag: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    /// Bash script run as the build user.
    pub script: String,
    pub workdir: Option<String>,
}

impl ContainerInvocation {
    pub fn new(tag: impl Into<String>, image: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            image: image.into(),
            mounts: Vec::new(),
            env: Vec::new(),
            script: script.into(),
            workdir: None,
        }
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Host side of the mount at `container`.
    pub fn host_path(&self, container: &str) -> Option<&Path> {
        self.mounts
            .iter()
            .find(|m| m.container == container)
            .map(|m| m.host.as_path())
    }
}

/// A build image described by a Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuild {
    /// Tag the image is built under and later run as.
    pub tag: String,
    pub dockerfile: PathBuf,
    /// Build context, the Dockerfile's directory.
    pub context: PathBuf,
    /// Log prefix, e.g. `hello@1.0 | Dockerfile`.
    pub log_tag: String,
}

impl ImageBuild {
    pub fn new(tag: impl Into<String>, dockerfile: &Path, log_tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            dockerfile: dockerfile.to_path_buf(),
            context: dockerfile_context(dockerfile),
            log_tag: log_tag.into(),
        }
    }
}

/// Directory a Dockerfile is built from.
pub fn dockerfile_context(dockerfile: &Path) -> PathBuf {
    match dockerfile.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Runs build steps in an isolated environment.
pub trait ExecutionContext: Send + Sync {
    /// Run the step to completion and return its exit code.
    ///
    /// A non-zero exit is not an error here; the caller maps it onto the unit
    /// that failed.
    fn run(&self, invocation: &ContainerInvocation) -> Result<i32>;

    /// Build and tag an image from a Dockerfile, returning the exit code.
    fn build_image(&self, build: &ImageBuild) -> Result<i32>;

    /// Identity of the runtime, part of every build fingerprint.
    fn runtime(&self) -> &str;
}

/// `docker run` (or any CLI-compatible runtime such as podman).
#[derive(Debug)]
pub struct DockerContext {
    runtime: String,
    /// Tags built by this process; later builds of the same tag are skipped.
    built_images: Mutex<HashSet<String>>,
}

impl DockerContext {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            built_images: Mutex::new(HashSet::new()),
        }
    }

    /// Argument vector for `<runtime> build`.
    pub fn build_args(&self, build: &ImageBuild) -> Vec<String> {
        vec![
            "build".to_string(),
            "-t".to_string(),
            build.tag.clone(),
            "-f".to_string(),
            build.dockerfile.display().to_string(),
            build.context.display().to_string(),
        ]
    }

    /// Full argument vector for `<runtime> run`.
    pub fn run_args(&self, inv: &ContainerInvocation) -> Result<Vec<String>> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        for mount in &inv.mounts {
            let host = fs::canonicalize(&mount.host)
                .io_context(|| format!("resolving mount {}", mount.host.display()))?;
            let mut spec = format!("{}:{}", host.display(), mount.container);
            if mount.read_only {
                spec.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(spec);
        }

        for (key, value) in &inv.env {
            if !ENV_ALLOW_LIST.contains(&key.as_str()) {
                warn!("[{}] dropping environment variable {} (not allowed)", inv.tag, key);
                continue;
            }
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        if let Some(dir) = &inv.workdir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }

        args.push(inv.image.clone());
        args.push("bash".to_string());
        args.push("-c".to_string());
        args.push(wrapper_script(inv)?);
        Ok(args)
    }
}

/// Root-side setup around the user's script.
///
/// Writable mounts are directories osforge created on the host, so their
/// owner is the user outputs are handed back to.
fn wrapper_script(inv: &ContainerInvocation) -> Result<String> {
    let mut writable = Vec::new();
    let mut chown_to_host = Vec::new();
    for mount in inv.mounts.iter().filter(|m| !m.read_only) {
        let meta = fs::metadata(&mount.host)
            .io_context(|| format!("reading owner of {}", mount.host.display()))?;
        let path = sh_quote(&mount.container);
        chown_to_host.push(format!("chown -R {}:{} {}", meta.uid(), meta.gid(), path));
        writable.push(path);
    }
    let writable = writable.join(" ");
    let preserve = ENV_ALLOW_LIST.join(",");
    let workdir = inv
        .workdir
        .as_deref()
        .map(|d| format!("cd {} && ", sh_quote(d)))
        .unwrap_or_default();

    Ok(format!(
        r#"set -euo pipefail
command -v sudo >/dev/null || pacman -Sy --needed --noconfirm sudo >/dev/null
id -u {user} >/dev/null 2>&1 || useradd -m {user}
passwd -d {user} >/dev/null
printf '%s\n' '{user} ALL=(root) NOPASSWD: /usr/bin/pacman' > /etc/sudoers.d/osforge
chmod 0440 /etc/sudoers.d/osforge
if compgen -G '{deps}/*.pkg.tar*' >/dev/null; then
  pacman -U --noconfirm --needed {deps}/*.pkg.tar*
fi
{chown_to_builder}
status=0
sudo -u {user} --preserve-env={preserve} bash -c {script} || status=$?
{chown_to_host}
exit $status
"#,
        user = BUILD_USER,
        deps = DEPS_MOUNT,
        preserve = preserve,
        script = sh_quote(&format!("set -euo pipefail\n{workdir}{}", inv.script)),
        chown_to_builder = if writable.is_empty() {
            String::new()
        } else {
            format!("chown -R {BUILD_USER}:{BUILD_USER} {writable}")
        },
        chown_to_host = chown_to_host.join("\n"),
    ))
}

impl ExecutionContext for DockerContext {
    fn run(&self, invocation: &ContainerInvocation) -> Result<i32> {
        let args = self.run_args(invocation)?;
        debug!("[{}] {} run in {}", invocation.tag, self.runtime, invocation.image);
        Cmd::new(&self.runtime).args(&args).run_tagged(&invocation.tag)
    }

    fn build_image(&self, build: &ImageBuild) -> Result<i32> {
        // Held across the build so concurrent packages sharing a Dockerfile
        // wait for the first one.
        let mut built = self
            .built_images
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if built.contains(&build.tag) {
            return Ok(0);
        }
        if !build.dockerfile.is_file() {
            return Err(Error::not_found("Dockerfile", build.dockerfile.display().to_string()));
        }
        debug!("[{}] {} build -t {}", build.log_tag, self.runtime, build.tag);
        let code = Cmd::new(&self.runtime)
            .args(self.build_args(build))
            .run_tagged(&build.log_tag)?;
        if code == 0 {
            built.insert(build.tag.clone());
        }
        Ok(code)
    }

    fn runtime(&self) -> &str {
        &self.runtime
    }
}

/// Single-quote a string for bash.
pub(crate) fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Handler = dyn Fn(&ContainerInvocation) -> Result<i32> + Send + Sync;

    /// Runs a closure in place of a container and records every invocation.
    pub struct FakeContext {
        handler: Box<Handler>,
        calls: AtomicUsize,
        pub seen: Mutex<Vec<ContainerInvocation>>,
        pub images: Mutex<Vec<ImageBuild>>,
    }

    impl FakeContext {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&ContainerInvocation) -> Result<i32> + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                images: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ExecutionContext for FakeContext {
        fn run(&self, invocation: &ContainerInvocation) -> Result<i32> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(invocation.clone());
            (self.handler)(invocation)
        }

        fn build_image(&self, build: &ImageBuild) -> Result<i32> {
            self.images.lock().unwrap().push(build.clone());
            Ok(0)
        }

        fn runtime(&self) -> &str {
            "fake"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process;
    use tempfile::TempDir;

    fn invocation(tmp: &TempDir) -> ContainerInvocation {
        let src = tmp.path().join("src");
        let out = tmp.path().join("out");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&out).unwrap();
        ContainerInvocation::new("hello@1.0 | makepkg", "archlinux:base-devel", "makepkg -f")
            .mount(Mount::ro(&src, "/src"))
            .mount(Mount::rw(&out, "/out"))
            .env("PKGDEST", "/out")
            .env("HOME", "/root")
            .workdir("/src")
    }

    #[test]
    fn run_args_follow_the_contract() {
        let tmp = TempDir::new().unwrap();
        let ctx = DockerContext::new("docker");
        let args = ctx.run_args(&invocation(&tmp)).unwrap();

        assert_eq!(&args[..2], ["run", "--rm"]);
        let src = fs::canonicalize(tmp.path().join("src")).unwrap();
        assert!(args.contains(&format!("{}:/src:ro", src.display())));
        let out = fs::canonicalize(tmp.path().join("out")).unwrap();
        assert!(args.contains(&format!("{}:/out", out.display())));
        assert!(args.contains(&"PKGDEST=/out".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("HOME=")));

        let script = args.last().unwrap();
        assert!(script.contains("NOPASSWD: /usr/bin/pacman"));
        assert!(script.contains("--preserve-env=PKGDEST,BUILDDIR,MAKEFLAGS"));
        let owner = fs::metadata(tmp.path().join("out")).unwrap();
        assert!(script.contains(&format!("chown -R {}:{} '/out'", owner.uid(), owner.gid())));
    }

    #[test]
    fn image_builds_use_the_dockerfile_directory_as_context() {
        let build = ImageBuild::new(
            "osforge-build/hello:0123456789abcdef",
            Path::new("/repo/docker/Dockerfile"),
            "hello@1.0 | Dockerfile",
        );
        assert_eq!(
            DockerContext::new("podman").build_args(&build),
            [
                "build",
                "-t",
                "osforge-build/hello:0123456789abcdef",
                "-f",
                "/repo/docker/Dockerfile",
                "/repo/docker",
            ]
        );
    }

    #[test]
    fn missing_dockerfile_is_reported_before_running() {
        let tmp = TempDir::new().unwrap();
        let build = ImageBuild::new("t:1", &tmp.path().join("Dockerfile"), "x");
        let err = DockerContext::new("nonexistent_runtime_xyz")
            .build_image(&build)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn missing_mount_source_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let inv = ContainerInvocation::new("x", "img", "true")
            .mount(Mount::rw(tmp.path().join("missing"), "/out"));
        assert!(DockerContext::new("docker").run_args(&inv).is_err());
    }

    #[test]
    fn quoting_survives_the_shell() {
        if !process::exists("sh") {
            return;
        }
        let tricky = "it's a \"test\" $HOME";
        let out = Cmd::new("sh")
            .arg("-c")
            .arg(format!("printf %s {}", sh_quote(tricky)))
            .run()
            .unwrap();
        assert_eq!(out.stdout, tricky);
    }
}
