//! Initrd building.
//!
//! The initrd comes from an external script run on the host with a fixed
//! contract: the output file path as its first argument and
//! `OSFORGE_INITRD_OUT` naming the directory that path lives in. The working
//! directory is the script's own directory.
//!
//! The result is cached by the content of the script's directory.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::artifact::filesystem::atomic_move;
use crate::cache::{ArtifactStaging, BuildCache};
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{hash_file, BuildFingerprint, ToolchainIdentity};
use crate::layout::OutputLayout;
use crate::manifest::InitrdSpec;
use crate::process::Cmd;
use crate::source::local;

/// Environment variable naming the output directory.
pub const OUT_ENV: &str = "OSFORGE_INITRD_OUT";

const IMAGE_NAME: &str = "initramfs.img";

#[derive(Debug, Clone)]
pub struct InitrdArtifact {
    pub fingerprint: BuildFingerprint,
    pub image_path: PathBuf,
}

#[derive(Serialize)]
struct InitrdInputs<'a> {
    script: &'a str,
    script_sha256: String,
}

pub struct InitrdBuilder<'a> {
    cache: &'a BuildCache,
    layout: &'a OutputLayout,
}

impl<'a> InitrdBuilder<'a> {
    pub fn new(cache: &'a BuildCache, layout: &'a OutputLayout) -> Self {
        Self { cache, layout }
    }

    pub fn plan(&self, spec: &InitrdSpec) -> Result<BuildFingerprint> {
        let script = &spec.build_script;
        if !script.is_file() {
            return Err(Error::not_found("initrd build script", script.display().to_string()));
        }
        let dir = script_dir(script);
        let source = local::fingerprint(dir)?;
        let (script_sha256, _) = hash_file(script)?;
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let inputs = InitrdInputs {
            script: &name,
            script_sha256,
        };
        BuildFingerprint::compute(&source, &inputs, &ToolchainIdentity::new("host", "initrd"))
    }

    pub fn build(&self, spec: &InitrdSpec) -> Result<InitrdArtifact> {
        let fp = self.plan(spec)?;
        let set = match self.cache.get_artifact(&fp)? {
            Some(set) => {
                info!("initrd up to date ({})", fp.short());
                set
            }
            None => {
                info!("building initrd with {}", spec.build_script.display());
                self.cache
                    .put_artifact(&fp, "initrd", |staging| run_script(spec, staging))?
            }
        };

        let image_path = self.layout.initrd_path();
        let dir = self.layout.initrd_dir();
        fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
        let partial = dir.join(format!(".{IMAGE_NAME}.partial"));
        fs::copy(set.root.join(IMAGE_NAME), &partial)
            .io_context(|| format!("installing {}", image_path.display()))?;
        atomic_move(&partial, &image_path)?;

        Ok(InitrdArtifact {
            fingerprint: fp,
            image_path,
        })
    }
}

fn script_dir(script: &Path) -> &Path {
    match script.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn run_script(spec: &InitrdSpec, staging: &mut ArtifactStaging) -> Result<()> {
    let script = fs::canonicalize(&spec.build_script)
        .io_context(|| format!("resolving {}", spec.build_script.display()))?;
    let output = staging.root.join(IMAGE_NAME);

    let mut attempt = 0;
    let exit_code = loop {
        let cmd = Cmd::new(script.to_string_lossy())
            .arg_path(&output)
            .env(OUT_ENV, &staging.root)
            .current_dir(script_dir(&script));
        match cmd.run_tagged("initrd") {
            // A script written moments ago can still be open for writing in a
            // forked child elsewhere in this process.
            Err(Error::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::ExecutableFileBusy && attempt < 5 =>
            {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(50 * attempt));
            }
            other => break other?,
        }
    };

    if exit_code != 0 {
        return Err(Error::Initrd {
            script: spec.build_script.clone(),
            exit_code,
        });
    }
    if !output.is_file() {
        return Err(Error::not_found(
            format!("initrd image from {}", script.display()),
            output.display().to_string(),
        ));
    }
    Ok(())
}
