use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::store::{DigestStore, SettingsError, StoreError, StoreSettings, sibling_path};

/// An unrecoverable failure to open a store file.
///
/// The process cannot continue with partially available state. The message tells the operator
/// how to get out of this situation.
#[derive(Debug, thiserror::Error)]
#[error("failed to load accumulator store {}, move or delete the file and restart", .path.display())]
pub struct LoadError {
    path: PathBuf,
    #[source]
    kind: LoadErrorKind,
}

impl LoadError {
    fn new(path: &Path, kind: impl Into<LoadErrorKind>) -> Self {
        Self {
            path: path.to_path_buf(),
            kind: kind.into(),
        }
    }

    /// The store file that could not be loaded.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying cause.
    pub fn kind(&self) -> &LoadErrorKind {
        &self.kind
    }
}

/// The cause of a [`LoadError`].
#[derive(Debug, thiserror::Error)]
pub enum LoadErrorKind {
    /// The store file could not be opened or recovered.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The settings sidecar could not be read or written.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl From<io::Error> for LoadErrorKind {
    fn from(error: io::Error) -> Self {
        Self::Store(StoreError::Io(error))
    }
}

/// Describes how [`open_store`] obtained a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Persistence is disabled, the store lives in memory.
    InMemory,
    /// No file existed, a new one was created.
    Created,
    /// An existing file was recovered in place.
    Recovered,
    /// An existing file recovered empty and was replaced with a fresh one.
    Recreated,
    /// The settings changed and all entries were copied into a fresh file.
    Migrated,
}

/// Opens the store at `path`, creating, recovering, or migrating it as needed.
///
/// If `persisted` is `false`, the path is ignored and an in-memory store is returned.
pub fn open_store(
    path: &Path,
    settings: &StoreSettings,
    persisted: bool,
) -> Result<(DigestStore, LoadOutcome), LoadError> {
    if !persisted {
        sluice_log::warn!(
            "accumulator persistence is disabled, unflushed histograms will be lost on shutdown"
        );
        return Ok((DigestStore::in_memory(settings.entries), LoadOutcome::InMemory));
    }

    load(path, settings).map_err(|kind| LoadError::new(path, kind))
}

fn load(path: &Path, settings: &StoreSettings) -> Result<(DigestStore, LoadOutcome), LoadErrorKind> {
    let temp_path = sibling_path(path, "temp");
    if temp_path.exists() {
        if let Some(store) = resume_migration(path, &temp_path, settings)? {
            return Ok((store, LoadOutcome::Migrated));
        }
    }

    if !path.exists() {
        sluice_log::debug!("accumulator store initialized as {}", path.display());
        let store = DigestStore::create(path, settings)?;
        settings.save(path)?;
        return Ok((store, LoadOutcome::Created));
    }

    if let Some(previous) = StoreSettings::load(path)? {
        if previous != *settings {
            return migrate(path, &previous, settings).map(|store| (store, LoadOutcome::Migrated));
        }
    }

    sluice_log::debug!("restoring accumulator state from {}", path.display());
    let store = DigestStore::recover(path, settings)?;

    if store.is_empty() {
        sluice_log::debug!("empty accumulator, reinitializing {}", path.display());
        store.close()?;
        drop(store);
        fs::remove_file(path)?;

        let store = DigestStore::create(path, settings)?;
        settings.save(path)?;
        return Ok((store, LoadOutcome::Recreated));
    }

    settings.save(path)?;
    Ok((store, LoadOutcome::Recovered))
}

fn ensure_compatible(previous: &StoreSettings, settings: &StoreSettings) -> Result<(), StoreError> {
    if previous.key_type != settings.key_type || previous.value_type != settings.value_type {
        return Err(StoreError::IncompatibleTypes {
            expected: format!("{}/{}", settings.key_type, settings.value_type),
            found: format!("{}/{}", previous.key_type, previous.value_type),
        });
    }

    Ok(())
}

fn migrate(
    path: &Path,
    previous: &StoreSettings,
    settings: &StoreSettings,
) -> Result<DigestStore, LoadErrorKind> {
    ensure_compatible(previous, settings)?;

    sluice_log::info!(
        "{} settings changed, reconfiguring (this may take a few moments)",
        path.display()
    );

    let temp_path = sibling_path(path, "temp");
    fs::rename(path, &temp_path)?;
    copy_from_temp(path, &temp_path, previous, settings)
}

/// Finishes a migration that was interrupted by a crash.
///
/// The temp file holds the complete old store until the copy finished and the new settings were
/// saved. Until then, the sidecar still describes the temp file and the file at `path` is partial.
/// Returns `None` if only the cleanup of the temp file was missing.
fn resume_migration(
    path: &Path,
    temp_path: &Path,
    settings: &StoreSettings,
) -> Result<Option<DigestStore>, LoadErrorKind> {
    match StoreSettings::load(path)? {
        Some(previous) if previous == *settings && path.exists() => {
            sluice_log::debug!("removing leftover {}", temp_path.display());
            fs::remove_file(temp_path)?;
            Ok(None)
        }
        Some(previous) => {
            ensure_compatible(&previous, settings)?;
            sluice_log::warn!(
                "{} reconfiguration was interrupted, restarting it from {}",
                path.display(),
                temp_path.display()
            );
            copy_from_temp(path, temp_path, &previous, settings).map(Some)
        }
        None => Err(StoreError::InterruptedMigration(temp_path.to_path_buf()).into()),
    }
}

/// Copies all entries of the old store at `temp_path` into a fresh store at `path`.
///
/// The temp file is removed only after the new settings have been saved.
fn copy_from_temp(
    path: &Path,
    temp_path: &Path,
    previous: &StoreSettings,
    settings: &StoreSettings,
) -> Result<DigestStore, LoadErrorKind> {
    let old = DigestStore::read_only(temp_path, previous)?;
    let store = DigestStore::create(path, settings)?;

    if !old.is_empty() {
        sluice_log::info!(
            "{} starting data migration ({} records)",
            path.display(),
            old.len()
        );
        for (key, digest) in old.entries() {
            store.insert(key, digest)?;
        }
        store.sync()?;
        sluice_log::info!("{} data migration finished", path.display());
    }

    settings.save(path)?;
    drop(old);
    fs::remove_file(temp_path)?;
    sluice_log::info!("{} reconfiguration finished", path.display());

    Ok(store)
}

/// Opens stores on demand and caches them by path.
///
/// All stores share the same desired settings. Requesting the same path twice returns the same
/// store.
#[derive(Debug)]
pub struct StoreLoader {
    settings: StoreSettings,
    persisted: bool,
    stores: Mutex<BTreeMap<PathBuf, Arc<DigestStore>>>,
}

impl StoreLoader {
    /// Creates a loader for stores with the given settings.
    pub fn new(settings: StoreSettings, persisted: bool) -> Self {
        Self {
            settings,
            persisted,
            stores: Mutex::new(BTreeMap::new()),
        }
    }

    /// The settings stores are opened with.
    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Returns the store at `path`, loading it on first access.
    pub fn get(&self, path: &Path) -> Result<Arc<DigestStore>, LoadError> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(path) {
            return Ok(Arc::clone(store));
        }

        let (store, outcome) = open_store(path, &self.settings, self.persisted)?;
        sluice_log::debug!(
            path = %path.display(),
            entries = store.len(),
            "accumulator store ready: {outcome:?}"
        );

        let store = Arc::new(store);
        stores.insert(path.to_path_buf(), Arc::clone(&store));
        Ok(store)
    }
}
