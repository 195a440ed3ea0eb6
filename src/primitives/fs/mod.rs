#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use glob::Pattern;

use crate::types::{Result, StoreError};

/// File names for every artifact a store keeps in its directory.
#[derive(Clone, Debug)]
pub struct FileLayout {
    dir: PathBuf,
}

impl FileLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current root metadata file.
    pub fn root_latest(&self, store: &str) -> PathBuf {
        self.dir.join(format!("{store}.root"))
    }

    /// Archived root metadata for `version`.
    pub fn root_archive(&self, store: &str, version: u64) -> PathBuf {
        self.dir.join(format!("{store}.root.{version}"))
    }

    /// Temporary root metadata file written before the swap.
    pub fn root_working(&self, store: &str) -> PathBuf {
        self.dir.join(format!(".{store}.root.tmp"))
    }

    /// Data file of an append log.
    pub fn append_log(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.log"))
    }

    /// Data file of a fixed-record log.
    pub fn fixed_data(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.dat"))
    }

    /// Index file of a fixed-record log.
    pub fn fixed_index(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.idx"))
    }

    /// File of one rolling log generation.
    pub fn generation(&self, key: &str, generation: u64) -> PathBuf {
        self.dir.join(format!("{key}.gen.{generation}"))
    }

    /// Archived root metadata files keyed by version.
    pub fn root_archives(&self, store: &str) -> Result<BTreeMap<u64, PathBuf>> {
        numbered_files(&self.dir, &format!("{store}.root."))
    }

    /// Generation files present for a rolling log, keyed by generation.
    pub fn generations(&self, key: &str) -> Result<BTreeMap<u64, PathBuf>> {
        numbered_files(&self.dir, &format!("{key}.gen."))
    }
}

/// Rejects keys that cannot be embedded in a file name unambiguously.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPathToFile {
            path: key.to_owned(),
        })
    }
}

/// Lists files in `dir` matching `pattern` (glob syntax; the directory is escaped).
pub fn resolve_pattern(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let dir_str = dir.to_str().ok_or_else(|| StoreError::FailedToResolvePath {
        path: dir.display().to_string(),
    })?;
    let full = format!("{}/{}", Pattern::escape(dir_str), pattern);
    let paths = glob::glob(&full).map_err(|source| StoreError::GlobPattern { source })?;
    let mut out = Vec::new();
    for entry in paths {
        out.push(entry.map_err(|source| StoreError::GlobRuntime { source })?);
    }
    Ok(out)
}

/// Files named `{prefix}{n}` with a decimal suffix, keyed by `n`.
pub fn numbered_files(dir: &Path, prefix: &str) -> Result<BTreeMap<u64, PathBuf>> {
    let mut out = BTreeMap::new();
    for path in resolve_pattern(dir, &format!("{}*", Pattern::escape(prefix)))? {
        let suffix = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(prefix));
        if let Some(n) = suffix.and_then(|s| s.parse::<u64>().ok()) {
            out.insert(n, path);
        }
    }
    Ok(out)
}

/// Creates `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(StoreError::InvalidPathToFile {
            path: dir.display().to_string(),
        });
    }
    fs::create_dir_all(dir).map_err(|source| StoreError::StdIoDirOps { source })
}

/// Flushes directory entries (renames, creations) of `dir` to stable storage.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir).map_err(|source| StoreError::StdIoOpen { source })?;
        handle
            .sync_all()
            .map_err(|source| StoreError::StdIoSync { source })?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Writes `bytes` to a fresh file at `path`, optionally fsyncing it.
pub fn write_file(path: &Path, bytes: &[u8], sync: bool) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|source| StoreError::StdIoOpen { source })?;
    file.write_all(bytes)
        .map_err(|source| StoreError::StdIoWrite { source })?;
    file.flush()
        .map_err(|source| StoreError::StdIoWrite { source })?;
    if sync {
        file.sync_all()
            .map_err(|source| StoreError::StdIoSync { source })?;
    }
    Ok(())
}

/// Reads a whole file.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| StoreError::StdIoRead { source })
}

/// Atomically renames `from` over `to`.
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|source| StoreError::StdIoDirOps { source })
}

/// Removes a file, treating "already gone" as success.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::StdIoDirOps { source }),
    }
}

/// Fails with [`StoreError::InvalidPathToFile`] if `path` exists but is not a regular file.
pub fn expect_file_or_absent(path: &Path) -> Result<()> {
    if path.exists() && !path.is_file() {
        return Err(StoreError::InvalidPathToFile {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Seconds since the Unix epoch, used to name backups.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
