#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::meta::{AtomicStoreFileContents, ResourceEntry, RootFiles};
use super::resource::Resource;
use super::{AtomicStore, StoreOptions};
use crate::log::{LogKind, LogShape, RollingOptions};
use crate::primitives::codec::Codec;
use crate::primitives::fs::{self, FileLayout};
use crate::types::{Result, StoreError};

pub(crate) struct Registration {
    pub(crate) shape: LogShape,
    pub(crate) codec: &'static str,
}

/// Startup builder that registers resources and validates their files.
///
/// Consumed by [`AtomicStore::open`]; no log is opened for writing until then.
pub struct AtomicStoreLoader {
    pub(crate) layout: FileLayout,
    pub(crate) name: String,
    pub(crate) options: StoreOptions,
    pub(crate) root: RootFiles,
    pub(crate) contents: AtomicStoreFileContents,
    pub(crate) registrations: BTreeMap<String, Registration>,
    pub(crate) rejected: Option<String>,
    initial_run: bool,
}

impl AtomicStoreLoader {
    /// Loads the store `name` in `dir`, creating the directory on first use.
    ///
    /// Options come from [`StoreOptions::from_env`].
    pub fn load(dir: &Path, name: &str) -> Result<Self> {
        Self::load_with_options(dir, name, StoreOptions::from_env())
    }

    /// Loads the store `name` in `dir` with explicit options.
    pub fn load_with_options(dir: &Path, name: &str, options: StoreOptions) -> Result<Self> {
        fs::validate_key(name)?;
        fs::ensure_dir(dir)?;
        let layout = FileLayout::new(dir);
        let root = RootFiles::new(layout.clone(), name);
        let loaded = root.load()?;
        let initial_run = loaded.is_none();
        let contents = loaded.unwrap_or_default();
        info!(
            store = name,
            dir = %dir.display(),
            version = contents.version,
            initial_run,
            "store.loader.load"
        );
        Ok(Self {
            layout,
            name: name.to_owned(),
            options,
            root,
            contents,
            registrations: BTreeMap::new(),
            rejected: None,
            initial_run,
        })
    }

    /// Starts a fresh store, moving an existing store directory aside first.
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        Self::create_with_options(dir, name, StoreOptions::from_env())
    }

    /// Like [`create`](Self::create) with explicit options.
    pub fn create_with_options(dir: &Path, name: &str, options: StoreOptions) -> Result<Self> {
        fs::validate_key(name)?;
        if dir.is_dir() && RootFiles::new(FileLayout::new(dir), name).exists()? {
            let backup = backup_path(dir)?;
            warn!(from = %dir.display(), to = %backup.display(), "store.loader.backup_existing");
            fs::rename(dir, &backup)?;
        }
        Self::load_with_options(dir, name, options)
    }

    /// Registers an [`AppendLog`](crate::log::AppendLog) resource.
    pub fn append_log<C: Codec>(&mut self, key: &str, codec: C) -> Result<Resource<C>> {
        self.register(key, LogShape::Append, codec.format())?;
        Ok(Resource::new(key, LogKind::Append, codec))
    }

    /// Registers a [`FixedAppendLog`](crate::log::FixedAppendLog) resource.
    pub fn fixed_append_log<C: Codec>(
        &mut self,
        key: &str,
        codec: C,
        record_size: u32,
    ) -> Result<Resource<C>> {
        if record_size == 0 {
            return Err(StoreError::inconsistent(key, "record size must be non-zero"));
        }
        self.register(key, LogShape::FixedAppend { record_size }, codec.format())?;
        Ok(Resource::new(key, LogKind::FixedAppend, codec))
    }

    /// Registers a [`RollingLog`](crate::log::RollingLog) resource.
    pub fn rolling_log<C: Codec>(
        &mut self,
        key: &str,
        codec: C,
        options: RollingOptions,
    ) -> Result<Resource<C>> {
        self.register(key, LogShape::Rolling(options), codec.format())?;
        Ok(Resource::new(key, LogKind::Rolling, codec))
    }

    fn register(&mut self, key: &str, shape: LogShape, codec: &'static str) -> Result<()> {
        fs::validate_key(key)?;
        if self.registrations.contains_key(key) {
            self.rejected.get_or_insert_with(|| key.to_owned());
            return Err(StoreError::DuplicateResourceKey {
                key: key.to_owned(),
            });
        }
        if let Some(entry) = self.contents.resources.get(key) {
            check_entry(key, entry, shape, codec)?;
            self.resolve(key, shape, entry)?;
        } else {
            for path in self.candidate_paths(key, shape)? {
                fs::expect_file_or_absent(&path)?;
            }
        }
        debug!(key, kind = shape.kind().as_str(), codec, "store.loader.register");
        self.registrations
            .insert(key.to_owned(), Registration { shape, codec });
        Ok(())
    }

    /// Files a resource of this shape may own; rolling generations are found by glob.
    fn candidate_paths(&self, key: &str, shape: LogShape) -> Result<Vec<PathBuf>> {
        Ok(match shape {
            LogShape::Append => vec![self.layout.append_log(key)],
            LogShape::FixedAppend { .. } => {
                vec![self.layout.fixed_data(key), self.layout.fixed_index(key)]
            }
            LogShape::Rolling(_) => self.layout.generations(key)?.into_values().collect(),
        })
    }

    /// Checks that every file holding committed records is present.
    fn resolve(&self, key: &str, shape: LogShape, entry: &ResourceEntry) -> Result<()> {
        let candidates = self.candidate_paths(key, shape)?;
        for path in &candidates {
            fs::expect_file_or_absent(path)?;
        }
        let Some(last) = entry.state.location else {
            return Ok(());
        };
        let required: Vec<PathBuf> = match shape {
            LogShape::Rolling(_) => (entry.state.first_generation..=last.generation)
                .map(|generation| self.layout.generation(key, generation))
                .collect(),
            _ => candidates,
        };
        match required.into_iter().find(|path| !path.is_file()) {
            Some(missing) => Err(StoreError::FailedToResolvePath {
                path: missing.display().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Root metadata entry stored for `key`, if the resource was committed before.
    pub fn look_up_resource(&self, key: &str) -> Option<&ResourceEntry> {
        self.contents.resources.get(key)
    }

    /// Version recorded in the loaded root metadata.
    pub fn version(&self) -> u64 {
        self.contents.version
    }

    /// True when no root metadata existed.
    pub fn is_initial_run(&self) -> bool {
        self.initial_run
    }

    /// Directory holding the store.
    pub fn persistence_path(&self) -> &Path {
        self.layout.dir()
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Options the store will open with.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Opens the store over the registered resources.
    pub fn open(self) -> Result<AtomicStore> {
        AtomicStore::open(self)
    }
}

fn check_entry(key: &str, entry: &ResourceEntry, shape: LogShape, codec: &str) -> Result<()> {
    if entry.kind != shape.kind() {
        return Err(StoreError::inconsistent(
            key,
            format!(
                "stored as a {} log, registered as {}",
                entry.kind.as_str(),
                shape.kind().as_str()
            ),
        ));
    }
    if entry.codec != codec {
        return Err(StoreError::inconsistent(
            key,
            format!("stored with codec '{}', registered with '{codec}'", entry.codec),
        ));
    }
    if entry.record_size != shape.record_size() {
        return Err(StoreError::inconsistent(
            key,
            format!(
                "stored with {}-byte records, registered with {}",
                entry.record_size,
                shape.record_size()
            ),
        ));
    }
    Ok(())
}

fn backup_path(dir: &Path) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::FailedToResolvePath {
            path: dir.display().to_string(),
        })?;
    let stamp = fs::unix_timestamp();
    let mut candidate = dir.with_file_name(format!("{name}.backup.{stamp}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.with_file_name(format!("{name}.backup.{stamp}-{n}"));
        n += 1;
    }
    Ok(candidate)
}
