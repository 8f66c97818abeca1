//! Persistent cache for downloaded archives and prepared kernel trees.
//!
//! Layout under the cache root:
//!
//! ```text
//! blobs/sha256/<xx>/<sha256>      content-addressed file entries
//! trees/<kind>/<key>/             directory entries (prepared kernel trees)
//! index/<kind>/<key>.json         one index entry per (kind, key)
//! locks/<kind>/<key>.lock         per-key write serialization
//! tmp/                            staging area, same filesystem as the above
//! ```
//!
//! An index entry is written only after its blob or tree has been fully
//! promoted, so the presence of an index file is the commit point. Entries
//! are never overwritten once they validate; the cache is append-only and
//! unbounded (operators prune it externally).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

/// Release archive downloaded for a target version.
pub const RELEASE_ARCHIVE: &str = "release_archive";
/// Kernel source published for an exact kernel release.
pub const MATCHED_SOURCE: &str = "kernel_source_matched";
/// Upstream kernel.org source for a base version.
pub const UPSTREAM_SOURCE: &str = "kernel_source_upstream";
/// Configured, header-ready kernel source tree.
pub const KERNEL_TREE: &str = "kernel_tree";

/// Storage format of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryFormat {
    /// A single content-addressed file.
    File,
    /// A directory tree stored in place.
    Tree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: String,
    pub key: String,
    pub format: EntryFormat,
    #[serde(default)]
    pub sha256: Option<String>,
    pub size_bytes: u64,
    pub stored_at_unix: u64,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// An index entry resolved to its on-disk location.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub entry: IndexEntry,
    pub path: PathBuf,
}

impl CacheEntry {
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.entry.meta.get(key).and_then(|v| v.as_str())
    }
}

/// Content check run against an entry's path during validation.
pub type Check<'a> = &'a dyn Fn(&Path) -> Result<()>;

#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub root: PathBuf,
    pub entries: BTreeMap<String, usize>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        for dir in [
            store.blobs_dir(),
            store.trees_dir(),
            store.index_dir(),
            store.locks_dir(),
            store.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .io_context(|| format!("creating cache directory {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs/sha256")
    }

    fn trees_dir(&self) -> PathBuf {
        self.root.join("trees")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn index_path(&self, kind: &str, key: &str) -> Result<PathBuf> {
        validate_segment("kind", kind)?;
        validate_segment("key", key)?;
        Ok(self.index_dir().join(kind).join(format!("{key}.json")))
    }

    fn blob_path(&self, sha256: &str) -> Result<PathBuf> {
        if !is_hex_64(sha256) {
            return Err(Error::Cache(format!("invalid sha256 in index: {sha256}")));
        }
        Ok(self.blobs_dir().join(&sha256[..2]).join(sha256))
    }

    fn tree_path(&self, kind: &str, key: &str) -> Result<PathBuf> {
        validate_segment("kind", kind)?;
        validate_segment("key", key)?;
        Ok(self.trees_dir().join(kind).join(key))
    }

    /// A fresh path inside the cache's staging area. Files staged here can be
    /// promoted by rename.
    pub fn tmp_path(&self, prefix: &str) -> PathBuf {
        self.tmp_dir().join(tmp_name(prefix))
    }

    /// Look up an entry. Does not check content; see [`CacheStore::validate`].
    pub fn get(&self, kind: &str, key: &str) -> Result<Option<CacheEntry>> {
        let index_path = self.index_path(kind, key)?;
        if !index_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&index_path)
            .io_context(|| format!("reading cache index {}", index_path.display()))?;
        let entry: IndexEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(index = %index_path.display(), "unreadable cache index: {e}");
                return Ok(None);
            }
        };
        let path = match entry.format {
            EntryFormat::File => {
                let sha = entry.sha256.as_deref().unwrap_or_default();
                self.blob_path(sha)?
            }
            EntryFormat::Tree => self.tree_path(kind, key)?,
        };
        Ok(Some(CacheEntry { entry, path }))
    }

    /// True if `(kind, key)` exists, its content hash still matches and
    /// `check` accepts it.
    pub fn validate(&self, kind: &str, key: &str, check: Check<'_>) -> Result<bool> {
        match self.get(kind, key)? {
            Some(found) => Ok(self.entry_is_valid(&found, check)),
            None => Ok(false),
        }
    }

    /// Return a validated entry, purging it first if validation fails.
    pub fn get_valid(&self, kind: &str, key: &str, check: Check<'_>) -> Result<Option<CacheEntry>> {
        let Some(found) = self.get(kind, key)? else {
            return Ok(None);
        };
        if self.entry_is_valid(&found, check) {
            return Ok(Some(found));
        }
        let _lock = self.lock(kind, key)?;
        // a writer may have replaced the entry while we were checking it
        match self.get(kind, key)? {
            Some(current) if self.entry_is_valid(&current, check) => Ok(Some(current)),
            Some(current) => {
                tracing::warn!(kind, key, "cache entry failed validation, purging");
                self.purge_locked(kind, key, &current)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn entry_is_valid(&self, found: &CacheEntry, check: Check<'_>) -> bool {
        match found.entry.format {
            EntryFormat::File => {
                if !found.path.is_file() {
                    tracing::debug!(path = %found.path.display(), "blob missing");
                    return false;
                }
                match sha256_file(&found.path) {
                    Ok((sha, _)) if Some(sha.as_str()) == found.entry.sha256.as_deref() => {}
                    Ok((sha, _)) => {
                        tracing::warn!(
                            path = %found.path.display(),
                            expected = found.entry.sha256.as_deref().unwrap_or("?"),
                            actual = %sha,
                            "blob hash mismatch"
                        );
                        return false;
                    }
                    Err(e) => {
                        tracing::warn!("hashing blob failed: {e}");
                        return false;
                    }
                }
            }
            EntryFormat::Tree => {
                if !found.path.is_dir() {
                    return false;
                }
            }
        }
        match check(&found.path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %found.path.display(), "cache content check failed: {e}");
                false
            }
        }
    }

    /// Store `src` (ideally staged via [`CacheStore::tmp_path`]) as a file
    /// entry. First writer wins: if a valid entry already exists it is
    /// returned and `src` is discarded.
    pub fn put_file(
        &self,
        kind: &str,
        key: &str,
        src: &Path,
        meta: BTreeMap<String, serde_json::Value>,
        check: Check<'_>,
    ) -> Result<CacheEntry> {
        if !src.is_file() {
            return Err(Error::Cache(format!(
                "cannot cache {kind}:{key}, source file missing: {}",
                src.display()
            )));
        }
        let _lock = self.lock(kind, key)?;

        if let Some(existing) = self.get(kind, key)? {
            if self.entry_is_valid(&existing, check) {
                tracing::debug!(kind, key, "entry already cached by another writer");
                let _ = fs::remove_file(src);
                return Ok(existing);
            }
            self.purge_locked(kind, key, &existing)?;
        }

        let (sha256, size_bytes) = sha256_file(src)?;
        let blob_path = self.blob_path(&sha256)?;
        if self.blob_is_intact(&blob_path, &sha256, check) {
            let _ = fs::remove_file(src);
        } else {
            if blob_path.exists() {
                tracing::warn!(blob = %blob_path.display(), "replacing damaged blob");
            }
            atomic_rename(src, &blob_path)?;
        }

        let entry = IndexEntry {
            kind: kind.to_string(),
            key: key.to_string(),
            format: EntryFormat::File,
            sha256: Some(sha256),
            size_bytes,
            stored_at_unix: now_unix(),
            meta,
        };
        self.write_index(kind, key, &entry)?;
        Ok(CacheEntry {
            entry,
            path: blob_path,
        })
    }

    /// An existing blob is reused only if its bytes still hash to its name.
    fn blob_is_intact(&self, blob_path: &Path, sha256: &str, check: Check<'_>) -> bool {
        if !blob_path.is_file() {
            return false;
        }
        match sha256_file(blob_path) {
            Ok((actual, _)) if actual == sha256 => check(blob_path).is_ok(),
            _ => false,
        }
    }

    /// Move the directory `src_dir` into the cache as a tree entry. Same
    /// first-writer-wins rule as [`CacheStore::put_file`].
    pub fn put_dir(
        &self,
        kind: &str,
        key: &str,
        src_dir: &Path,
        meta: BTreeMap<String, serde_json::Value>,
        check: Check<'_>,
    ) -> Result<CacheEntry> {
        if !src_dir.is_dir() {
            return Err(Error::Cache(format!(
                "cannot cache {kind}:{key}, source directory missing: {}",
                src_dir.display()
            )));
        }
        let _lock = self.lock(kind, key)?;

        if let Some(existing) = self.get(kind, key)? {
            if self.entry_is_valid(&existing, check) {
                tracing::debug!(kind, key, "tree already cached by another writer");
                let _ = fs::remove_dir_all(src_dir);
                return Ok(existing);
            }
            self.purge_locked(kind, key, &existing)?;
        }

        let dest = self.tree_path(kind, key)?;
        if dest.exists() {
            // leftover from an interrupted writer; never indexed
            fs::remove_dir_all(&dest)
                .io_context(|| format!("removing stale tree {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("creating {}", parent.display()))?;
        }
        fs::rename(src_dir, &dest).io_context(|| {
            format!("moving {} into cache at {}", src_dir.display(), dest.display())
        })?;

        let entry = IndexEntry {
            kind: kind.to_string(),
            key: key.to_string(),
            format: EntryFormat::Tree,
            sha256: None,
            size_bytes: dir_size(&dest),
            stored_at_unix: now_unix(),
            meta,
        };
        self.write_index(kind, key, &entry)?;
        Ok(CacheEntry { entry, path: dest })
    }

    /// Drop the index entry for `(kind, key)` and its tree, if any. Blobs are
    /// left for external pruning since other keys may share them.
    pub fn purge(&self, kind: &str, key: &str) -> Result<()> {
        let _lock = self.lock(kind, key)?;
        if let Some(found) = self.get(kind, key)? {
            self.purge_locked(kind, key, &found)?;
        }
        Ok(())
    }

    fn purge_locked(&self, kind: &str, key: &str, found: &CacheEntry) -> Result<()> {
        let index_path = self.index_path(kind, key)?;
        if index_path.exists() {
            fs::remove_file(&index_path)
                .io_context(|| format!("removing cache index {}", index_path.display()))?;
        }
        if found.entry.format == EntryFormat::Tree && found.path.exists() {
            fs::remove_dir_all(&found.path)
                .io_context(|| format!("removing cached tree {}", found.path.display()))?;
        }
        Ok(())
    }

    /// Index entries of one kind, newest first.
    pub fn list(&self, kind: &str) -> Result<Vec<IndexEntry>> {
        validate_segment("kind", kind)?;
        let dir = self.index_dir().join(kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for ent in fs::read_dir(&dir).io_context(|| format!("reading {}", dir.display()))? {
            let path = ent.io_context(|| format!("reading {}", dir.display()))?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = fs::read(&path) else {
                continue;
            };
            if let Ok(entry) = serde_json::from_slice::<IndexEntry>(&bytes) {
                out.push(entry);
            }
        }
        out.sort_by(|a, b| {
            b.stored_at_unix
                .cmp(&a.stored_at_unix)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    pub fn status(&self) -> Result<CacheStatus> {
        let mut entries = BTreeMap::new();
        let mut total_bytes = 0u64;
        for kind in [RELEASE_ARCHIVE, MATCHED_SOURCE, UPSTREAM_SOURCE, KERNEL_TREE] {
            let listed = self.list(kind)?;
            total_bytes += listed.iter().map(|e| e.size_bytes).sum::<u64>();
            entries.insert(kind.to_string(), listed.len());
        }
        Ok(CacheStatus {
            root: self.root.clone(),
            entries,
            total_bytes,
        })
    }

    fn write_index(&self, kind: &str, key: &str, entry: &IndexEntry) -> Result<()> {
        let path = self.index_path(kind, key)?;
        let bytes = serde_json::to_vec_pretty(entry)
            .map_err(|e| Error::Cache(format!("serializing index for {kind}:{key}: {e}")))?;
        let tmp = self.tmp_path("index.json");
        fs::write(&tmp, bytes).io_context(|| format!("writing {}", tmp.display()))?;
        atomic_rename(&tmp, &path)
    }

    /// Exclusive per-key lock. Blocks while another process holds it.
    fn lock(&self, kind: &str, key: &str) -> Result<KeyLock> {
        validate_segment("kind", kind)?;
        validate_segment("key", key)?;
        let path = self.locks_dir().join(kind).join(format!("{key}.lock"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }

        // The lock file is never unlinked: removing a file another process
        // still holds would let a third process lock a fresh inode.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("opening lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            tracing::info!(kind, key, "waiting for another writer to release the cache entry");
            file.lock_exclusive()
                .io_context(|| format!("locking {}", path.display()))?;
        }
        Ok(KeyLock { file })
    }
}

/// Holds a cache key lock until dropped.
#[derive(Debug)]
struct KeyLock {
    file: File,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// SHA-256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .io_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}", std::process::id())
}

fn atomic_rename(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // EXDEV: copy next to the destination, then rename
            let staged = dst.with_extension("partial");
            fs::copy(src, &staged).io_context(|| {
                format!("copying {} to {}", src.display(), staged.display())
            })?;
            fs::rename(&staged, dst)
                .io_context(|| format!("renaming {} to {}", staged.display(), dst.display()))?;
            fs::remove_file(src).io_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Cache(format!("cache {what} must not be empty")));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(Error::Cache(format!(
            "cache {what} must be a safe filename segment: {value}"
        )));
    }
    Ok(())
}

fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
