//! Manifest model.
//!
//! The manifest is a TOML document describing the system: its packages, the
//! kernel and the initrd. It is read once per invocation and never mutated.
//!
//! ```toml
//! version = "0.3.0"
//! name = "system"
//! bootloader = true
//!
//! [kernel]
//! url = "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.9.1.tar.xz"
//! [kernel.options]
//! SERIAL_CORE = true
//! VT = false
//!
//! [[package]]
//! name = "hello"
//! version = "1.0"
//! source = { kind = "pkgbuild", local_path = "packages/hello" }
//! build = { build_deps = ["libhello"], dockerfile = "docker/Dockerfile" }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Container image used for package builds when none is given.
pub const DEFAULT_BUILD_IMAGE: &str = "archlinux:base-devel";

/// Image name used when the manifest does not set one.
pub const DEFAULT_IMAGE_NAME: &str = "system";

/// Parsed, validated system description.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: String,
    #[serde(default = "default_image_name")]
    pub name: String,
    /// Install the pinned EFI loader at `boot/EFI/BOOT/BOOTX64.EFI`.
    #[serde(default)]
    pub bootloader: bool,
    #[serde(rename = "package", default)]
    pub packages: Vec<PackageSpec>,
    #[serde(default)]
    pub kernel: Option<KernelSpec>,
    #[serde(default)]
    pub initrd: Option<InitrdSpec>,
}

fn default_image_name() -> String {
    DEFAULT_IMAGE_NAME.to_string()
}

/// One managed package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub build: BuildOptions,
}

/// Where a package's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDescriptor {
    /// A prebuilt package archive.
    Binary {
        url: String,
        #[serde(default)]
        checksum: Option<Sha256>,
    },
    /// A remote repository containing a PKGBUILD.
    Git { repo_url: String, rev: String },
    /// A local directory containing a PKGBUILD.
    Pkgbuild { local_path: PathBuf },
}

impl SourceDescriptor {
    /// Short variant name used in fingerprints and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Binary { .. } => "binary",
            Self::Git { .. } => "git",
            Self::Pkgbuild { .. } => "pkgbuild",
        }
    }
}

/// Build settings for a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildOptions {
    /// Container image providing `makepkg`.
    pub image: String,
    /// Dockerfile to build the image from instead. Its directory is the
    /// build context.
    pub dockerfile: Option<PathBuf>,
    /// Managed packages installed into the build container first.
    pub build_deps: Vec<String>,
    /// Subset of produced archives to keep when the build yields a group.
    pub pick: Option<Vec<String>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            image: DEFAULT_BUILD_IMAGE.to_string(),
            dockerfile: None,
            build_deps: Vec::new(),
            pick: None,
        }
    }
}

/// Kernel source and configuration toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelSpec {
    pub url: String,
    #[serde(default)]
    pub checksum: Option<Sha256>,
    /// Option names without the `CONFIG_` prefix mapped to enabled/disabled.
    #[serde(default)]
    pub options: BTreeMap<String, bool>,
    #[serde(default)]
    pub version: Option<String>,
}

impl KernelSpec {
    /// Source descriptor handed to the resolver.
    pub fn source(&self) -> SourceDescriptor {
        SourceDescriptor::Binary {
            url: self.url.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitrdSpec {
    pub build_script: PathBuf,
}

/// Lowercase hex sha256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256(String);

impl Sha256 {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a computed digest.
    pub fn matches(&self, hex: &str) -> bool {
        self.0.eq_ignore_ascii_case(hex)
    }
}

impl TryFrom<String> for Sha256 {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(value))
        } else {
            Err(format!("invalid sha256 checksum '{value}'"))
        }
    }
}

impl From<Sha256> for String {
    fn from(value: Sha256) -> Self {
        value.0
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Manifest {
    /// Read, parse and validate a manifest file.
    ///
    /// Relative local paths are resolved against the manifest's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading manifest {}", path.display()), e))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base)
    }

    /// Parse and validate manifest text, resolving paths against `base_dir`.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: Self =
            toml::from_str(text).map_err(|e| Error::InvalidManifest(e.to_string()))?;
        manifest.resolve_paths(base_dir);
        manifest.validate()?;
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        for pkg in &mut self.packages {
            if let SourceDescriptor::Pkgbuild { local_path } = &mut pkg.source {
                if local_path.is_relative() {
                    *local_path = base_dir.join(&*local_path);
                }
            }
            if let Some(dockerfile) = &mut pkg.build.dockerfile {
                if dockerfile.is_relative() {
                    *dockerfile = base_dir.join(&*dockerfile);
                }
            }
        }
        if let Some(initrd) = &mut self.initrd {
            if initrd.build_script.is_relative() {
                initrd.build_script = base_dir.join(&initrd.build_script);
            }
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pkg in &self.packages {
            if pkg.name.is_empty() || pkg.name.contains('/') || pkg.name.starts_with('.') {
                return Err(Error::InvalidManifest(format!(
                    "invalid package name '{}'",
                    pkg.name
                )));
            }
            if !names.insert(pkg.name.as_str()) {
                return Err(Error::InvalidManifest(format!(
                    "duplicate package name '{}'",
                    pkg.name
                )));
            }
            if pkg.build.dockerfile.is_some() && pkg.build.image != DEFAULT_BUILD_IMAGE {
                return Err(Error::InvalidManifest(format!(
                    "package '{}' sets both build.image and build.dockerfile",
                    pkg.name
                )));
            }
        }

        for pkg in &self.packages {
            for dep in &pkg.build.build_deps {
                if !names.contains(dep.as_str()) {
                    return Err(Error::InvalidManifest(format!(
                        "package '{}' depends on unknown package '{}'",
                        pkg.name, dep
                    )));
                }
                if dep == &pkg.name {
                    return Err(Error::InvalidManifest(format!(
                        "package '{}' depends on itself",
                        pkg.name
                    )));
                }
            }
        }
        self.build_order()?;

        if let Some(kernel) = &self.kernel {
            let mut seen = HashMap::new();
            for name in kernel.options.keys() {
                let normalized = crate::build::kernel::normalize_option_name(name);
                if let Some(previous) = seen.insert(normalized.clone(), name) {
                    return Err(Error::InvalidManifest(format!(
                        "kernel options '{previous}' and '{name}' both name CONFIG_{normalized}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// Package names ordered so every package follows its build dependencies.
    ///
    /// Fails with [`Error::InvalidManifest`] when the dependency relation has a
    /// cycle. Ties keep manifest order.
    pub fn build_order(&self) -> Result<Vec<&str>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            manifest: &'a Manifest,
            name: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            order: &mut Vec<&'a str>,
        ) -> Result<()> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(Error::InvalidManifest(format!(
                        "build dependency cycle through '{name}'"
                    )))
                }
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(pkg) = manifest.package(name) {
                for dep in &pkg.build.build_deps {
                    visit(manifest, dep, marks, order)?;
                }
            }
            marks.insert(name, Mark::Done);
            order.push(name);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut order = Vec::with_capacity(self.packages.len());
        for pkg in &self.packages {
            visit(self, &pkg.name, &mut marks, &mut order)?;
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn parse(text: &str) -> Result<Manifest> {
        Manifest::parse(text, Path::new("/project"))
    }

    #[test]
    fn parses_all_source_kinds() {
        let text = format!(
            r#"
version = "1.0"

[[package]]
name = "bin"
version = "1"
source = {{ kind = "binary", url = "https://example.org/bin.pkg.tar.zst", checksum = "{CHECKSUM}" }}

[[package]]
name = "remote"
version = "2"
source = {{ kind = "git", repo_url = "https://example.org/remote.git", rev = "main" }}

[[package]]
name = "local"
version = "3"
author = "someone"
source = {{ kind = "pkgbuild", local_path = "pkgs/local" }}
build = {{ build_deps = ["bin"], pick = ["local"] }}
"#
        );
        let manifest = parse(&text).unwrap();
        assert_eq!(manifest.name, DEFAULT_IMAGE_NAME);
        assert_eq!(manifest.packages.len(), 3);
        assert_eq!(manifest.packages[0].build.image, DEFAULT_BUILD_IMAGE);
        assert_eq!(
            manifest.packages[2].source,
            SourceDescriptor::Pkgbuild {
                local_path: PathBuf::from("/project/pkgs/local")
            }
        );
        assert_eq!(manifest.packages[2].build.build_deps, vec!["bin"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let text = r#"
version = "1"
[[package]]
name = "a"
version = "1"
source = { kind = "pkgbuild", local_path = "a" }
[[package]]
name = "a"
version = "2"
source = { kind = "pkgbuild", local_path = "b" }
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate package name 'a'"));
    }

    #[test]
    fn bootloader_is_opt_in() {
        assert!(!parse("version = \"1\"\n").unwrap().bootloader);
        assert!(parse("version = \"1\"\nbootloader = true\n").unwrap().bootloader);
    }

    #[test]
    fn dockerfile_replaces_image() {
        let text = r#"
version = "1"
[[package]]
name = "a"
version = "1"
source = { kind = "pkgbuild", local_path = "a" }
build = { dockerfile = "docker/Dockerfile" }
"#;
        let manifest = parse(text).unwrap();
        assert_eq!(
            manifest.packages[0].build.dockerfile.as_deref(),
            Some(Path::new("/project/docker/Dockerfile"))
        );

        let both = text.replace("dockerfile =", "image = \"custom:latest\", dockerfile =");
        let err = parse(&both).unwrap_err();
        assert!(err.to_string().contains("both build.image and build.dockerfile"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let text = r#"
version = "1"
[[package]]
name = "a"
version = "1"
source = { kind = "pkgbuild", local_path = "a" }
build = { build_deps = ["ghost"] }
"#;
        assert!(matches!(parse(text), Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let text = r#"
version = "1"
[[package]]
name = "a"
version = "1"
source = { kind = "pkgbuild", local_path = "a" }
build = { build_deps = ["b"] }
[[package]]
name = "b"
version = "1"
source = { kind = "pkgbuild", local_path = "b" }
build = { build_deps = ["a"] }
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn build_order_puts_dependencies_first() {
        let text = r#"
version = "1"
[[package]]
name = "app"
version = "1"
source = { kind = "pkgbuild", local_path = "app" }
build = { build_deps = ["lib"] }
[[package]]
name = "lib"
version = "1"
source = { kind = "pkgbuild", local_path = "lib" }
"#;
        let manifest = parse(text).unwrap();
        assert_eq!(manifest.build_order().unwrap(), vec!["lib", "app"]);
    }

    #[test]
    fn malformed_checksum_is_rejected() {
        let text = r#"
version = "1"
[[package]]
name = "a"
version = "1"
source = { kind = "binary", url = "https://example.org/a", checksum = "abc" }
"#;
        assert!(matches!(parse(text), Err(Error::InvalidManifest(_))));
    }

    #[test]
    fn kernel_options_and_initrd_parse() {
        let text = r#"
version = "1"
[kernel]
url = "https://example.org/linux-6.9.tar.xz"
[kernel.options]
SERIAL_CORE = true
VT = false
[initrd]
build_script = "initrd/build.sh"
"#;
        let manifest = parse(text).unwrap();
        let kernel = manifest.kernel.unwrap();
        assert_eq!(kernel.options.get("SERIAL_CORE"), Some(&true));
        assert_eq!(kernel.options.get("VT"), Some(&false));
        assert_eq!(
            manifest.initrd.unwrap().build_script,
            PathBuf::from("/project/initrd/build.sh")
        );
    }

    #[test]
    fn kernel_option_aliases_are_rejected() {
        let text = r#"
version = "1"
[kernel]
url = "https://example.org/linux.tar.xz"
[kernel.options]
CONFIG_VT = true
vt = false
"#;
        assert!(matches!(parse(text), Err(Error::InvalidManifest(_))));
    }
}
