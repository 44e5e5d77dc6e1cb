//! Storage engine registry
//!
//! Capture sessions pick their engine by identifier at runtime. The
//! registry maps identifiers to constructors; `mmap` and `rw` are
//! registered by default.

use std::fs::{File, OpenOptions};
use std::path::Path;

use dashmap::DashMap;
use tracing::debug;

use crate::storage::{CaptureStorage, FileHeader, MmapStorage, ReadWriteStorage, StorageOptions};
use crate::{PcapMapError, Result};

/// Constructor for an unprepared engine session over an open file
pub type EngineFactory = fn(File, StorageOptions) -> Box<dyn CaptureStorage>;

/// Identifier of the memory-mapped engine
pub const MMAP_ENGINE: &str = "mmap";

/// Identifier of the positional read/write engine
pub const RW_ENGINE: &str = "rw";

fn mmap_factory(file: File, options: StorageOptions) -> Box<dyn CaptureStorage> {
    Box::new(MmapStorage::new(file, options))
}

fn rw_factory(file: File, options: StorageOptions) -> Box<dyn CaptureStorage> {
    Box::new(ReadWriteStorage::new(file, options))
}

/// Table of available storage engines
pub struct EngineRegistry {
    engines: DashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            engines: DashMap::new(),
        }
    }

    /// Create a registry holding the built-in engines
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry
            .engines
            .insert(MMAP_ENGINE.to_string(), mmap_factory as EngineFactory);
        registry
            .engines
            .insert(RW_ENGINE.to_string(), rw_factory as EngineFactory);
        registry
    }

    /// Register an engine under `name`
    ///
    /// # Errors
    ///
    /// Returns error if the name is already taken
    pub fn register(&self, name: &str, factory: EngineFactory) -> Result<()> {
        match self.engines.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(PcapMapError::ConfigError(
                format!("Storage engine already registered: {name}"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(factory);
                debug!("Registered storage engine: {name}");
                Ok(())
            }
        }
    }

    /// Remove an engine, returning whether it was registered
    pub fn unregister(&self, name: &str) -> bool {
        self.engines.remove(name).is_some()
    }

    /// Whether an engine is registered under `name`
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Registered engine names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.engines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Build an unprepared session of engine `name` over `file`
    ///
    /// # Errors
    ///
    /// Returns `UnknownEngine` if nothing is registered under `name`
    pub fn instantiate(
        &self,
        name: &str,
        file: File,
        options: StorageOptions,
    ) -> Result<Box<dyn CaptureStorage>> {
        let factory = *self
            .engines
            .get(name)
            .ok_or_else(|| PcapMapError::UnknownEngine(name.to_string()))?;
        Ok(factory(file, options))
    }

    /// Create a capture file and return a session prepared for writing
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unknown or the file cannot be
    /// created; header and mapping failures are fatal
    pub fn create(
        &self,
        name: &str,
        path: &Path,
        options: StorageOptions,
    ) -> Result<Box<dyn CaptureStorage>> {
        if !self.contains(name) {
            return Err(PcapMapError::UnknownEngine(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let storage = self.instantiate(name, file, options)?;
        storage.write_file_header()?;
        storage.prepare_writing()?;

        debug!("Created {} for writing with {name}", path.display());
        Ok(storage)
    }

    /// Open a capture file and return a session prepared for reading
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unknown, the file cannot be opened or
    /// its header is invalid; mapping failures are fatal
    pub fn open(
        &self,
        name: &str,
        path: &Path,
        options: StorageOptions,
    ) -> Result<(Box<dyn CaptureStorage>, FileHeader)> {
        let file = File::open(path)?;

        let storage = self.instantiate(name, file, options)?;
        let header = storage.read_file_header()?;
        storage.prepare_reading()?;

        debug!("Opened {} for reading with {name}", path.display());
        Ok((storage, header))
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_engines() {
        let registry = EngineRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["mmap".to_string(), "rw".to_string()]);
        assert!(EngineRegistry::new().names().is_empty());
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = EngineRegistry::new();
        registry.register("custom", mmap_factory).unwrap();
        assert!(registry.contains("custom"));
        assert!(registry.register("custom", rw_factory).is_err());

        assert!(registry.unregister("custom"));
        assert!(!registry.unregister("custom"));
        assert!(!registry.contains("custom"));
    }

    #[test]
    fn test_unknown_engine() {
        let registry = EngineRegistry::with_defaults();
        let file = NamedTempFile::new().unwrap();

        assert!(matches!(
            registry.instantiate("sg", file.reopen().unwrap(), StorageOptions::default()),
            Err(PcapMapError::UnknownEngine(name)) if name == "sg"
        ));
    }

    #[test]
    fn test_instantiate_identifies_engine() {
        let registry = EngineRegistry::with_defaults();
        let file = NamedTempFile::new().unwrap();

        for name in [MMAP_ENGINE, RW_ENGINE] {
            let storage = registry
                .instantiate(name, file.reopen().unwrap(), StorageOptions::default())
                .unwrap();
            assert_eq!(storage.name(), name);
        }
    }
}
