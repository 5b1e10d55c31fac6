//! Tool configuration.
//!
//! Looked up in order: an explicit `--config` path, `osforge.toml` beside the
//! manifest, then `<config dir>/osforge/config.toml`. Missing files fall back
//! to defaults. `OSFORGE_OUTPUT_DIR` overrides `output_dir` last.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Per-project config file name, looked up beside the manifest.
pub const PROJECT_CONFIG_FILE: &str = "osforge.toml";

/// Environment variable overriding [`Config::output_dir`].
pub const OUTPUT_DIR_ENV: &str = "OSFORGE_OUTPUT_DIR";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Output root. Relative paths are resolved against the manifest directory.
    pub output_dir: PathBuf,

    /// Maximum concurrent package builds.
    pub jobs: usize,

    /// Attempts per network fetch before giving up.
    pub fetch_retries: u32,

    pub fetch_timeout_secs: u64,

    /// Container runtime binary (`docker` or `podman`).
    pub container_runtime: String,

    /// Container image used for kernel builds.
    pub kernel_image: String,

    pub vm: VmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("build"),
            jobs: default_jobs(),
            fetch_retries: 3,
            fetch_timeout_secs: 60,
            container_runtime: "docker".to_string(),
            kernel_image: "archlinux:base-devel".to_string(),
            vm: VmConfig::default(),
        }
    }
}

/// Emulator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    pub memory_gb: u32,
    pub cpus: u32,
    /// Size of the writable user-data disk.
    pub user_disk_gb: u32,
    /// OVMF code image. Searched in well-known locations when unset.
    pub ovmf_code: Option<PathBuf>,
    /// OVMF variable store template.
    pub ovmf_vars: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_gb: 2,
            cpus: 4,
            user_disk_gb: 10,
            ovmf_code: None,
            ovmf_vars: None,
        }
    }
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading config {}", path.display()), e))?;
        Self::from_toml(&text).map_err(|reason| Error::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn from_toml(text: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        if config.jobs == 0 {
            return Err("jobs must be at least 1".to_string());
        }
        if config.fetch_retries == 0 {
            return Err("fetch_retries must be at least 1".to_string());
        }
        Ok(config)
    }

    /// Locate and load the effective config for a manifest directory.
    pub fn load(explicit: Option<&Path>, manifest_dir: &Path) -> Result<Self> {
        let mut config = match Self::locate(explicit, manifest_dir)? {
            Some(path) => {
                debug!("using config {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        if let Some(dir) = std::env::var_os(OUTPUT_DIR_ENV) {
            config.output_dir = PathBuf::from(dir);
        }
        if config.output_dir.is_relative() {
            config.output_dir = manifest_dir.join(&config.output_dir);
        }
        Ok(config)
    }

    fn locate(explicit: Option<&Path>, manifest_dir: &Path) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::not_found("config file", path.display().to_string()));
            }
            return Ok(Some(path.to_path_buf()));
        }

        let project = manifest_dir.join(PROJECT_CONFIG_FILE);
        if project.is_file() {
            return Ok(Some(project));
        }

        Ok(dirs::config_dir()
            .map(|d| d.join("osforge").join("config.toml"))
            .filter(|p| p.is_file()))
    }
}
