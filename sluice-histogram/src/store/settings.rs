use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::sibling_path;

/// Type identity of persisted keys.
pub const KEY_TYPE: &str = "sluice.HistogramKey";
/// Type identity of persisted values.
pub const VALUE_TYPE: &str = "sluice.AgentDigest";
/// Identity of the binary encoding used for keys and values.
pub const MARSHALLER: &str = "sluice.binary.v1";

/// An error raised when reading or writing a settings sidecar.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Reading or writing the file failed.
    #[error("failed to access settings file")]
    Io(#[from] io::Error),
    /// The file does not contain valid settings.
    #[error("failed to parse settings file")]
    Parse(#[from] serde_json::Error),
}

/// The configuration a store file was created with.
///
/// Stored as JSON next to the store file. If the desired settings differ from the persisted ones
/// on startup, the store is migrated.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreSettings {
    /// Type identity of keys.
    pub key_type: String,
    /// Type identity of values.
    pub value_type: String,
    /// Identity of the key and value encoding.
    pub marshaller: String,
    /// Number of entries the store is sized for.
    pub entries: u64,
    /// Expected average size of an encoded key in bytes.
    pub avg_key_size: u32,
    /// Expected average size of an encoded digest in bytes.
    pub avg_value_size: u32,
}

impl StoreSettings {
    /// Creates settings for the current key and value types.
    pub fn new(entries: u64, avg_key_size: u32, avg_value_size: u32) -> Self {
        Self {
            key_type: KEY_TYPE.to_owned(),
            value_type: VALUE_TYPE.to_owned(),
            marshaller: MARSHALLER.to_owned(),
            entries,
            avg_key_size,
            avg_value_size,
        }
    }

    /// Returns the path of the sidecar belonging to the store at `store_path`.
    pub fn sidecar_path(store_path: &Path) -> PathBuf {
        sibling_path(store_path, "settings")
    }

    /// Reads the sidecar of the store at `store_path`, if it exists.
    pub fn load(store_path: &Path) -> Result<Option<Self>, SettingsError> {
        let path = Self::sidecar_path(store_path);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the sidecar of the store at `store_path`.
    pub fn save(&self, store_path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(Self::sidecar_path(store_path), json)?;
        Ok(())
    }

    /// Expected size of a single entry, used to size write buffers.
    pub fn entry_size(&self) -> usize {
        self.avg_key_size as usize + self.avg_value_size as usize
    }
}
