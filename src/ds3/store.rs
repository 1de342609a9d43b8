//! Calibration storage for quick controller re-initialization
//!
//! This module defines the byte-oriented key-value store the calibration
//! engine and controller session persist into. Rows are keyed by device
//! address and split into two logical tables:
//! - `Ds3Data`: the EEPROM + status snapshot captured over USB
//! - `Ds3Calibration`: the opaque gyro calibration blob

use crate::ds3::types::DeviceAddress;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Logical tables of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// EEPROM contents followed by the status snapshot
    Ds3Data,
    /// Serialized gyro calibration state
    Ds3Calibration,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Ds3Data, Table::Ds3Calibration];

    /// Name used in the store file
    pub fn name(self) -> &'static str {
        match self {
            Table::Ds3Data => "ds3_data",
            Table::Ds3Calibration => "ds3_calibration",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode store contents: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store is unavailable: {0}")]
    Unavailable(String),
}

/// Point lookup and upsert keyed by device address
pub trait KeyValueStore: Send + Sync {
    /// Fetch a row, `Ok(None)` when the key is absent
    fn get(&self, table: Table, key: &DeviceAddress) -> Result<Option<Vec<u8>>, StoreError>;

    /// Insert or replace a row
    fn upsert(&self, table: Table, key: &DeviceAddress, value: &[u8]) -> Result<(), StoreError>;
}

type Rows = HashMap<Table, HashMap<DeviceAddress, Vec<u8>>>;

/// Volatile store, used for tests and when no storage path is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<Rows>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in a table
    pub fn len(&self, table: Table) -> usize {
        self.rows
            .lock()
            .map(|rows| rows.get(&table).map_or(0, |t| t.len()))
            .unwrap_or(0)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, table: Table, key: &DeviceAddress) -> Result<Option<Vec<u8>>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(rows.get(&table).and_then(|t| t.get(key)).cloned())
    }

    fn upsert(&self, table: Table, key: &DeviceAddress, value: &[u8]) -> Result<(), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        rows.entry(table).or_default().insert(*key, value.to_vec());
        Ok(())
    }
}

/// On-disk representation: table -> address key -> hex-encoded row
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    tables: HashMap<String, HashMap<String, String>>,
}

/// JSON-file backed store; every upsert rewrites the file
pub struct JsonFileStore {
    path: PathBuf,
    rows: Mutex<Rows>,
}

impl JsonFileStore {
    /// Open a store file, starting empty when it is missing or unreadable
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let rows = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<StoreFile>(&content) {
                Ok(file) => {
                    debug!("Loaded calibration store from: {}", path.display());
                    decode_rows(file)
                }
                Err(e) => {
                    warn!("Failed to parse store file: {}", e);
                    Rows::new()
                }
            },
            Err(_) => {
                debug!("No existing store file found at: {}", path.display());
                Rows::new()
            }
        };

        Self {
            path,
            rows: Mutex::new(rows),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, rows: &Rows) -> Result<(), StoreError> {
        let file = StoreFile {
            tables: rows
                .iter()
                .map(|(table, entries)| {
                    let encoded = entries
                        .iter()
                        .map(|(addr, value)| (addr.to_key(), hex::encode(value)))
                        .collect();
                    (table.name().to_string(), encoded)
                })
                .collect(),
        };

        let content = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, content)?;

        debug!("Saved calibration store to: {}", self.path.display());
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, table: Table, key: &DeviceAddress) -> Result<Option<Vec<u8>>, StoreError> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(rows.get(&table).and_then(|t| t.get(key)).cloned())
    }

    fn upsert(&self, table: Table, key: &DeviceAddress, value: &[u8]) -> Result<(), StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;
        rows.entry(table).or_default().insert(*key, value.to_vec());
        self.save(&rows)?;

        info!("Stored {:?} row for {}", table, key);
        Ok(())
    }
}

fn decode_rows(file: StoreFile) -> Rows {
    let mut rows = Rows::new();
    for (name, entries) in file.tables {
        let Some(table) = Table::from_name(&name) else {
            warn!("Skipping unknown store table '{}'", name);
            continue;
        };
        for (key, value) in entries {
            match (key.parse::<DeviceAddress>(), hex::decode(&value)) {
                (Ok(addr), Ok(bytes)) => {
                    rows.entry(table).or_default().insert(addr, bytes);
                }
                _ => warn!("Skipping malformed {:?} row '{}'", table, key),
            }
        }
    }
    rows
}
