//! Content-addressed build cache.
//!
//! Two namespaces keyed by fingerprint:
//!
//! ```text
//! cache/
//!   sources/<fp>/entry.json, tree/
//!   artifacts/<fp>/entry.json, root/, archives/
//!   tmp/<fp>-<pid>-<n>/        producer scratch, swept by gc
//!   locks/<fp>.lock            cross-process exclusion
//! ```
//!
//! Producers run only on a miss and write into a private directory under
//! `tmp/`. Publication writes `entry.json` into that directory and renames it
//! to its final key, so a key either holds a complete entry or nothing. An
//! entry that fails validation on read is removed and reported as a miss.

mod inflight;

pub use inflight::{InflightGuard, InflightSnapshot, InflightTable};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifact::filesystem::dir_size;
use crate::error::{Error, IoContext, Result};
use crate::fingerprint::{BuildFingerprint, SourceFingerprint};

const ENTRY_FILE: &str = "entry.json";
const SOURCE_PAYLOAD: &str = "tree";
const ARTIFACT_ROOT: &str = "root";
const ARTIFACT_ARCHIVES: &str = "archives";

/// Which namespace an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Source,
    Artifact,
}

impl EntryKind {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Source => "sources",
            Self::Artifact => "artifacts",
        }
    }
}

/// Persisted beside every payload as `entry.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub kind: EntryKind,
    pub fingerprint: String,
    #[serde(default)]
    pub package: Option<String>,
    /// Relative paths of every non-directory entry under `root/`.
    #[serde(default)]
    pub files: Vec<String>,
    /// File names under `archives/`.
    #[serde(default)]
    pub archives: Vec<String>,
    pub created_at_unix: u64,
    pub last_referenced_unix: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Files produced by one build.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub package: String,
    pub fingerprint: BuildFingerprint,
    /// Unpacked tree, laid out as it will appear in the sysroot.
    pub root: PathBuf,
    /// Relative paths under `root`.
    pub files: Vec<PathBuf>,
    /// Raw package archives, used to install this package into other builds.
    pub archives: Vec<PathBuf>,
    pub meta: BTreeMap<String, String>,
}

/// Scratch area handed to an artifact producer.
#[derive(Debug)]
pub struct ArtifactStaging {
    /// Fill with the unpacked tree.
    pub root: PathBuf,
    /// Place raw archives here.
    pub archives: PathBuf,
    /// Free-form metadata persisted with the entry.
    pub meta: BTreeMap<String, String>,
}

/// Outcome of [`BuildCache::garbage_collect`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub removed_sources: usize,
    pub removed_artifacts: usize,
    pub removed_temp: usize,
    /// Entries kept because they are being produced or locked by another process.
    pub skipped_in_use: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceStatus {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub sources: NamespaceStatus,
    pub artifacts: NamespaceStatus,
    pub temp_dirs: usize,
}

/// Cache rooted at `<output>/cache`.
#[derive(Debug)]
pub struct BuildCache {
    root: PathBuf,
    inflight: InflightTable,
}

impl BuildCache {
    /// Open (and create if needed) the cache at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let cache = Self {
            root: root.to_path_buf(),
            inflight: InflightTable::new(),
        };
        for dir in [
            cache.namespace_dir(EntryKind::Source),
            cache.namespace_dir(EntryKind::Artifact),
            cache.tmp_dir(),
            cache.locks_dir(),
        ] {
            fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, kind: EntryKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    fn entry_dir(&self, kind: EntryKind, key: &str) -> PathBuf {
        self.namespace_dir(kind).join(key)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Cached tree for a source fingerprint.
    pub fn get_source(&self, fp: &SourceFingerprint) -> Result<Option<PathBuf>> {
        Ok(self
            .read_entry(EntryKind::Source, fp.as_str())?
            .map(|_| self.entry_dir(EntryKind::Source, fp.as_str()).join(SOURCE_PAYLOAD)))
    }

    /// Return the cached tree for `fp`, running `producer` to create it on a miss.
    ///
    /// The producer receives an empty directory to fill.
    pub fn put_source<F>(&self, fp: &SourceFingerprint, producer: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let key = fp.as_str();
        let _inflight = self.inflight.acquire(key);
        let _lock = self.lock_key(key)?;

        if let Some(tree) = self.get_source(fp)? {
            debug!("source {} already cached", fp.short());
            return Ok(tree);
        }

        let scratch = self.scratch_dir(key)?;
        let tree = scratch.path.join(SOURCE_PAYLOAD);
        fs::create_dir_all(&tree).io_context(|| format!("creating {}", tree.display()))?;
        producer(&tree)?;

        let now = now_unix();
        let entry = EntryMeta {
            kind: EntryKind::Source,
            fingerprint: key.to_string(),
            package: None,
            files: Vec::new(),
            archives: Vec::new(),
            created_at_unix: now,
            last_referenced_unix: now,
            meta: BTreeMap::new(),
        };
        let final_dir = self.publish(scratch, EntryKind::Source, key, &entry)?;
        info!("cached source {}", fp.short());
        Ok(final_dir.join(SOURCE_PAYLOAD))
    }

    /// Cached artifact set for a build fingerprint.
    pub fn get_artifact(&self, fp: &BuildFingerprint) -> Result<Option<ArtifactSet>> {
        let Some(entry) = self.read_entry(EntryKind::Artifact, fp.as_str())? else {
            return Ok(None);
        };
        let dir = self.entry_dir(EntryKind::Artifact, fp.as_str());
        Ok(Some(artifact_set(&dir, fp, entry)))
    }

    /// Return the artifact for `fp`, running `producer` to create it on a miss.
    pub fn put_artifact<F>(&self, fp: &BuildFingerprint, package: &str, producer: F) -> Result<ArtifactSet>
    where
        F: FnOnce(&mut ArtifactStaging) -> Result<()>,
    {
        let key = fp.as_str();
        let _inflight = self.inflight.acquire(key);
        let _lock = self.lock_key(key)?;

        if let Some(set) = self.get_artifact(fp)? {
            debug!("artifact {} for {} already cached", fp.short(), package);
            return Ok(set);
        }

        let scratch = self.scratch_dir(key)?;
        let mut staging = ArtifactStaging {
            root: scratch.path.join(ARTIFACT_ROOT),
            archives: scratch.path.join(ARTIFACT_ARCHIVES),
            meta: BTreeMap::new(),
        };
        for dir in [&staging.root, &staging.archives] {
            fs::create_dir_all(dir).io_context(|| format!("creating {}", dir.display()))?;
        }
        producer(&mut staging)?;

        let now = now_unix();
        let entry = EntryMeta {
            kind: EntryKind::Artifact,
            fingerprint: key.to_string(),
            package: Some(package.to_string()),
            files: list_files(&staging.root)?,
            archives: list_files(&staging.archives)?,
            created_at_unix: now,
            last_referenced_unix: now,
            meta: staging.meta,
        };
        let final_dir = self.publish(scratch, EntryKind::Artifact, key, &entry)?;
        info!("cached artifact {} for {}", fp.short(), package);
        Ok(artifact_set(&final_dir, fp, entry))
    }

    /// Remove every entry not in `live` and not in flight, plus stale scratch
    /// directories.
    ///
    /// Holds the in-flight table for the whole pass; producers started
    /// meanwhile wait until it returns.
    pub fn garbage_collect(&self, live: &HashSet<String>) -> Result<GcStats> {
        let inflight = self.inflight.freeze();
        let mut stats = GcStats::default();

        for kind in [EntryKind::Source, EntryKind::Artifact] {
            for (key, path) in self.list_keys(kind)? {
                if live.contains(&key) {
                    continue;
                }
                if inflight.contains(&key) {
                    stats.skipped_in_use += 1;
                    continue;
                }
                let Some(_lock) = self.try_lock_key(&key)? else {
                    stats.skipped_in_use += 1;
                    continue;
                };
                let size = dir_size(&path);
                fs::remove_dir_all(&path).io_context(|| format!("removing {}", path.display()))?;
                debug!("gc removed {} {}", kind.dir_name(), key);
                stats.freed_bytes += size;
                match kind {
                    EntryKind::Source => stats.removed_sources += 1,
                    EntryKind::Artifact => stats.removed_artifacts += 1,
                }
            }
        }

        let tmp = self.tmp_dir();
        for ent in fs::read_dir(&tmp).io_context(|| format!("reading {}", tmp.display()))? {
            let ent = ent.io_context(|| format!("reading {}", tmp.display()))?;
            let name = ent.file_name().to_string_lossy().into_owned();
            let key = name.split('-').next().unwrap_or_default();
            // Only scratch directories of this cache are ours to sweep.
            if !is_hex_64(key) || inflight.contains(key) {
                continue;
            }
            let Some(_lock) = self.try_lock_key(key)? else {
                continue;
            };
            let path = ent.path();
            let size = dir_size(&path);
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.io_context(|| format!("removing {}", path.display()))?;
            stats.freed_bytes += size;
            stats.removed_temp += 1;
        }

        Ok(stats)
    }

    /// Entry counts and sizes per namespace.
    pub fn status(&self) -> Result<CacheStatus> {
        let mut namespaces = [NamespaceStatus::default(), NamespaceStatus::default()];
        for (slot, kind) in namespaces
            .iter_mut()
            .zip([EntryKind::Source, EntryKind::Artifact])
        {
            for (_, path) in self.list_keys(kind)? {
                slot.entries += 1;
                slot.bytes += dir_size(&path);
            }
        }
        let temp_dirs = fs::read_dir(self.tmp_dir())
            .map(|rd| rd.filter_map(std::result::Result::ok).count())
            .unwrap_or(0);
        let [sources, artifacts] = namespaces;
        Ok(CacheStatus {
            root: self.root.clone(),
            sources,
            artifacts,
            temp_dirs,
        })
    }

    fn list_keys(&self, kind: EntryKind) -> Result<Vec<(String, PathBuf)>> {
        let dir = self.namespace_dir(kind);
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for ent in fs::read_dir(&dir).io_context(|| format!("reading {}", dir.display()))? {
            let ent = ent.io_context(|| format!("reading {}", dir.display()))?;
            let name = ent.file_name().to_string_lossy().into_owned();
            if is_hex_64(&name) {
                out.push((name, ent.path()));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Load and validate an entry, removing it if it is corrupt.
    fn read_entry(&self, kind: EntryKind, key: &str) -> Result<Option<EntryMeta>> {
        let dir = self.entry_dir(kind, key);
        if !dir.exists() {
            return Ok(None);
        }

        match validate_entry(&dir, kind, key) {
            Ok(mut entry) => {
                entry.last_referenced_unix = now_unix();
                if let Err(e) = write_entry(&dir, &entry) {
                    warn!("could not touch cache entry {}: {}", dir.display(), e);
                }
                Ok(Some(entry))
            }
            Err(reason) => {
                warn!(
                    "discarding corrupt cache entry {}: {}",
                    dir.display(),
                    reason
                );
                fs::remove_dir_all(&dir).io_context(|| format!("removing {}", dir.display()))?;
                Ok(None)
            }
        }
    }

    fn scratch_dir(&self, key: &str) -> Result<ScratchDir> {
        let path = self.tmp_dir().join(tmp_name(key));
        fs::create_dir_all(&path).io_context(|| format!("creating {}", path.display()))?;
        Ok(ScratchDir { path })
    }

    fn publish(&self, scratch: ScratchDir, kind: EntryKind, key: &str, entry: &EntryMeta) -> Result<PathBuf> {
        write_entry(&scratch.path, entry)?;
        let final_dir = self.entry_dir(kind, key);
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)
                .io_context(|| format!("removing {}", final_dir.display()))?;
        }
        fs::rename(&scratch.path, &final_dir).io_context(|| {
            format!(
                "publishing {} to {}",
                scratch.path.display(),
                final_dir.display()
            )
        })?;
        scratch.disarm();
        Ok(final_dir)
    }

    fn lock_file(&self, key: &str) -> Result<File> {
        let path = self.locks_dir().join(format!("{key}.lock"));
        // Lock files are never unlinked: removing a held lock would let a
        // second process lock a fresh inode at the same path.
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("opening lock file {}", path.display()))
    }

    fn lock_key(&self, key: &str) -> Result<KeyLock> {
        let file = self.lock_file(key)?;
        if file.try_lock_exclusive().is_err() {
            info!("waiting for another process to finish {}", &key[..key.len().min(12)]);
            file.lock_exclusive()
                .io_context(|| format!("locking cache key {key}"))?;
        }
        Ok(KeyLock { file })
    }

    fn try_lock_key(&self, key: &str) -> Result<Option<KeyLock>> {
        let file = self.lock_file(key)?;
        Ok(file.try_lock_exclusive().ok().map(|()| KeyLock { file }))
    }
}

/// Exclusive advisory lock on one cache key. Unlocks on drop.
#[derive(Debug)]
struct KeyLock {
    file: File,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Producer scratch directory. Removed on drop unless published.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn disarm(mut self) {
        self.path = PathBuf::new();
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if !self.path.as_os_str().is_empty() && self.path.exists() {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

fn artifact_set(dir: &Path, fp: &BuildFingerprint, entry: EntryMeta) -> ArtifactSet {
    let archives_dir = dir.join(ARTIFACT_ARCHIVES);
    ArtifactSet {
        package: entry.package.unwrap_or_default(),
        fingerprint: fp.clone(),
        root: dir.join(ARTIFACT_ROOT),
        files: entry.files.into_iter().map(PathBuf::from).collect(),
        archives: entry
            .archives
            .into_iter()
            .map(|a| archives_dir.join(a))
            .collect(),
        meta: entry.meta,
    }
}

fn validate_entry(dir: &Path, kind: EntryKind, key: &str) -> std::result::Result<EntryMeta, String> {
    let bytes = fs::read(dir.join(ENTRY_FILE)).map_err(|e| format!("entry.json unreadable: {e}"))?;
    let entry: EntryMeta =
        serde_json::from_slice(&bytes).map_err(|e| format!("entry.json unparsable: {e}"))?;
    if entry.kind != kind {
        return Err(format!("expected {:?} entry, found {:?}", kind, entry.kind));
    }
    if entry.fingerprint != key {
        return Err(format!("fingerprint mismatch ({})", entry.fingerprint));
    }
    match kind {
        EntryKind::Source => {
            if !dir.join(SOURCE_PAYLOAD).is_dir() {
                return Err("source tree missing".to_string());
            }
        }
        EntryKind::Artifact => {
            let root = dir.join(ARTIFACT_ROOT);
            if let Some(missing) = entry
                .files
                .iter()
                .find(|f| fs::symlink_metadata(root.join(f)).is_err())
            {
                return Err(format!("payload file missing: {missing}"));
            }
            let archives = dir.join(ARTIFACT_ARCHIVES);
            if let Some(missing) = entry.archives.iter().find(|a| !archives.join(a).is_file()) {
                return Err(format!("archive missing: {missing}"));
            }
        }
    }
    Ok(entry)
}

fn write_entry(dir: &Path, entry: &EntryMeta) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(entry).map_err(|e| Error::json("cache entry", e))?;
    let tmp = dir.join(tmp_name("entry.json"));
    fs::write(&tmp, bytes).io_context(|| format!("writing {}", tmp.display()))?;
    let path = dir.join(ENTRY_FILE);
    fs::rename(&tmp, &path).io_context(|| format!("writing {}", path.display()))
}

/// Relative paths of every non-directory entry below `root`, sorted.
fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for ent in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let ent = ent.map_err(|e| {
            Error::io(
                format!("walking {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if ent.file_type().is_dir() {
            continue;
        }
        let rel = ent.path().strip_prefix(root).unwrap_or(ent.path());
        out.push(rel.to_string_lossy().into_owned());
    }
    Ok(out)
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Unique scratch name beginning with `prefix-`.
pub(crate) fn tmp_name(prefix: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}", std::process::id())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
