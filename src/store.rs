//! # Collection Registry
//!
//! A [`DataStore`] maps collection names to open [`Index`] handles. Opening
//! is lazy: a collection's database is touched the first time something asks
//! for it, and the handle is cached so there is never more than one per
//! name. The registry map sits behind a reader/writer lock — lookups of
//! already-open collections take the read path; only the first open of a
//! collection takes the write lock.
//!
//! Collection names become file names under the data directory, so they are
//! held to a strict allowlist; anything that could traverse paths is
//! rejected before it reaches the filesystem.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::Index;

/// File extension for collection databases.
const DB_EXTENSION: &str = "db";

// =============================================================================
// DataStore
// =============================================================================

/// The registry of open collections.
pub struct DataStore {
    config: Config,
    data_dir: PathBuf,
    indexes: RwLock<HashMap<String, Arc<Index>>>,
    valid_name: Regex,
}

impl DataStore {
    /// Opens the registry over `config.data_dir`, creating the directory if
    /// it does not exist.
    pub fn open(config: Config) -> Result<DataStore> {
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::Internal(format!("data dir {}: {e}", data_dir.display())))?;

        Ok(DataStore {
            config,
            data_dir,
            indexes: RwLock::new(HashMap::new()),
            valid_name: Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("static regex"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the collection's index, opening it lazily.
    ///
    /// With `create = false` a collection that does not exist on disk is
    /// [`Error::NotFound`]; with `create = true` it is created empty.
    pub fn get_index(&self, name: &str, create: bool) -> Result<Arc<Index>> {
        self.validate_name(name)?;

        if let Some(index) = self.indexes.read().get(name) {
            return Ok(Arc::clone(index));
        }

        let mut indexes = self.indexes.write();
        // somebody else may have opened it while we waited for the lock
        if let Some(index) = indexes.get(name) {
            return Ok(Arc::clone(index));
        }

        let path = self.collection_path(name);
        if !path.exists() && !create {
            return Err(Error::NotFound(format!("collection {name} does not exist")));
        }

        let created = !path.exists();
        let index = Arc::new(Index::open(name, &path, !self.config.read_only())?);
        if created {
            info!(collection = name, "created collection");
        }
        indexes.insert(name.to_string(), Arc::clone(&index));
        Ok(index)
    }

    /// Lists every collection present on disk, sorted by name.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.data_dir)
            .map_err(|e| Error::Internal(format!("data dir {}: {e}", self.data_dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if self.valid_name.is_match(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn collection_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{name}.{DB_EXTENSION}"))
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        if self.valid_name.is_match(name) {
            Ok(())
        } else {
            Err(Error::bad_request(format!("invalid collection name: {name}")))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
