//! Squashfs image builder.
//!
//! Wraps `mksquashfs`. Images are written beside the destination and renamed
//! into place, so a failed or interrupted run never leaves a truncated image
//! under the final name.

use std::fs;
use std::path::Path;
use tracing::info;

use super::filesystem::human_readable_size;
use crate::error::{Error, IoContext, Result};
use crate::process::Cmd;

/// Options for building a squashfs image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: String,
    /// Block size (e.g. "128K", "1M").
    pub block_size: String,
    /// Pin inode and superblock timestamps to the epoch.
    pub fixed_timestamps: bool,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            block_size: "1M".to_string(),
            fixed_timestamps: true,
        }
    }
}

impl SquashfsOptions {
    /// `mksquashfs` flags after the source and destination.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-comp".to_string(),
            self.compression.clone(),
            "-b".to_string(),
            self.block_size.clone(),
            "-noappend".to_string(),
            "-all-root".to_string(),
            "-no-xattrs".to_string(),
        ];
        if self.fixed_timestamps {
            args.extend(["-mkfs-time", "0", "-all-time", "0"].map(String::from));
        }
        args
    }
}

/// Pack `source_dir` into a squashfs image at `output`.
pub fn build_squashfs(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Result<()> {
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.squashfs".to_string());
    let partial = parent.join(format!(".{file_name}.partial"));
    if partial.exists() {
        fs::remove_file(&partial).io_context(|| format!("removing {}", partial.display()))?;
    }

    info!("creating {} ({} compression)", output.display(), options.compression);
    let code = Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(&partial)
        .args(options.args())
        .run_tagged("mksquashfs")?;
    if code != 0 {
        let _ = fs::remove_file(&partial);
        return Err(Error::Command {
            program: "mksquashfs".to_string(),
            exit_code: code,
            detail: format!("packing {}", source_dir.display()),
        });
    }

    fs::rename(&partial, output)
        .io_context(|| format!("renaming {} to {}", partial.display(), output.display()))?;
    if let Ok(md) = fs::metadata(output) {
        info!("image {} ({})", output.display(), human_readable_size(md.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn default_flags_are_reproducible() {
        let args = SquashfsOptions::default().args();
        assert_eq!(&args[..4], ["-comp", "zstd", "-b", "1M"]);
        assert!(args.contains(&"-noappend".to_string()));
        assert!(args.contains(&"-all-root".to_string()));
        assert!(args.windows(2).any(|w| w == ["-all-time", "0"]));
    }

    #[test]
    fn packs_a_directory() {
        if !process::exists("mksquashfs") {
            eprintln!("mksquashfs not installed, skipping");
            return;
        }
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("root");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::write(src.join("etc/release"), "osforge").unwrap();
        let out = tmp.path().join("images/system-1.squashfs");

        let options = SquashfsOptions {
            // Older squashfs-tools lack the timestamp flags; gzip is always built in.
            compression: "gzip".to_string(),
            fixed_timestamps: false,
            ..Default::default()
        };
        build_squashfs(&src, &out, &options).unwrap();

        let mut magic = [0u8; 4];
        fs::File::open(&out).unwrap().read_exact(&mut magic).unwrap();
        assert_eq!(&magic, b"hsqs");
        assert!(!tmp.path().join("images/.system-1.squashfs.partial").exists());
    }
}
