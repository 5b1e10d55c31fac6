//! Filesystem utilities for artifact building.
//!
//! Tree copies with overlay semantics, package archive extraction, atomic
//! moves and size accounting.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{IoContext, Result};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Recursively copy a directory, preserving symlinks and permissions.
///
/// Existing destination entries are replaced, so copying several trees onto
/// the same destination gives last-write-wins overlay semantics. Entries whose
/// type changes (file over directory or the reverse) are replaced whole.
///
/// ```rust,ignore
/// use osforge::artifact::filesystem::copy_dir_recursive;
///
/// copy_dir_recursive(Path::new("a/root"), Path::new("sysroot"))?;
/// copy_dir_recursive(Path::new("b/root"), Path::new("sysroot"))?; // b wins
/// ```
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    copy_dir_filtered(src, dst, |_| true)
}

/// Like [`copy_dir_recursive`], skipping top-level entries for which `keep`
/// returns false.
pub fn copy_dir_filtered<F>(src: &Path, dst: &Path, keep: F) -> Result<()>
where
    F: Fn(&str) -> bool,
{
    ensure_dir(dst)?;
    for entry in fs::read_dir(src).io_context(|| format!("reading directory {}", src.display()))? {
        let entry = entry.io_context(|| format!("reading directory {}", src.display()))?;
        if !keep(&entry.file_name().to_string_lossy()) {
            continue;
        }
        copy_entry(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

fn copy_entry(src_path: &Path, dst_path: &Path) -> Result<()> {
    let file_type = fs::symlink_metadata(src_path)
        .io_context(|| format!("stat {}", src_path.display()))?
        .file_type();

    if file_type.is_dir() {
        if let Ok(existing) = fs::symlink_metadata(dst_path) {
            if !existing.is_dir() {
                fs::remove_file(dst_path)
                    .io_context(|| format!("replacing {}", dst_path.display()))?;
            }
        }
        return copy_dir_filtered(src_path, dst_path, |_| true);
    }

    remove_existing(dst_path)?;
    if file_type.is_symlink() {
        let target =
            fs::read_link(src_path).io_context(|| format!("readlink {}", src_path.display()))?;
        std::os::unix::fs::symlink(&target, dst_path)
            .io_context(|| format!("creating symlink {}", dst_path.display()))?;
    } else {
        fs::copy(src_path, dst_path).io_context(|| {
            format!(
                "copying {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        Ok(_) => {
            fs::remove_file(path).io_context(|| format!("replacing {}", path.display()))?;
            fs::create_dir_all(path).io_context(|| format!("creating {}", path.display()))
        }
        Err(_) => fs::create_dir_all(path).io_context(|| format!("creating {}", path.display())),
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => {
            fs::remove_dir_all(path).io_context(|| format!("replacing {}", path.display()))
        }
        Ok(_) => fs::remove_file(path).io_context(|| format!("replacing {}", path.display())),
        Err(_) => Ok(()),
    }
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Used for the "build to temp, then move into place" pattern.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem: copy beside the destination, then rename.
            let staged = dst.with_extension("partial");
            fs::copy(src, &staged).io_context(|| {
                format!("copying {} to {}", src.display(), staged.display())
            })?;
            fs::rename(&staged, dst)
                .io_context(|| format!("renaming {} to {}", staged.display(), dst.display()))?;
            fs::remove_file(src).io_context(|| format!("removing {}", src.display()))
        }
    }
}

/// Extract a tar archive (zstd, gzip or uncompressed) into `dest`.
///
/// Compression is detected from the file's magic bytes.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive).io_context(|| format!("opening {}", archive.display()))?;
    let mut magic = [0u8; 4];
    let read = file
        .read(&mut magic)
        .io_context(|| format!("reading {}", archive.display()))?;
    file.seek(SeekFrom::Start(0))
        .io_context(|| format!("reading {}", archive.display()))?;
    fs::create_dir_all(dest).io_context(|| format!("creating {}", dest.display()))?;

    let context = || format!("unpacking {}", archive.display());
    if read == 4 && magic == ZSTD_MAGIC {
        let decoder = zstd::stream::Decoder::new(file).io_context(context)?;
        unpack_tar(tar::Archive::new(decoder), dest).io_context(context)
    } else if read >= 2 && magic[..2] == GZIP_MAGIC {
        let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
        unpack_tar(tar::Archive::new(decoder), dest).io_context(context)
    } else {
        unpack_tar(tar::Archive::new(BufReader::new(file)), dest).io_context(context)
    }
}

fn unpack_tar<R: Read>(mut archive: tar::Archive<R>, dest: &Path) -> std::io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

/// Total size in bytes of regular files below `path`. Unreadable entries count
/// as zero.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter(|md| md.is_file())
        .map(|md| md.len())
        .sum()
}

/// Format a byte count with a binary unit.
pub fn human_readable_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    match bytes {
        b if b >= TB => format!("{:.2} TB", b as f64 / TB as f64),
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} bytes"),
    }
}
