//! # Database Builder
//!
//! This module provides the `DatabaseBuilder` API for configuring and opening
//! locusdb instances: heap and table sizing, the persistence adapter, the
//! trigger listener and the type catalog.
//!
//! ## Builder Pattern
//!
//! `DatabaseBuilder` uses the builder pattern to provide a fluent, type-safe API
//! for database configuration. Settings can be chained together before calling
//! `open()` to create the database. Every setting is optional.
//!
//! ## Configuration Options
//!
//! | Option             | Default                | Description                            |
//! |--------------------|------------------------|----------------------------------------|
//! | heap_size          | 64 MiB                 | Bytes of anonymous memory for objects  |
//! | max_locators       | 65536                  | Locator table capacity                 |
//! | record_range_size  | 1024                   | Entries per record list range          |
//! | max_txn_objects    | 65536                  | Distinct objects one transaction may   |
//! |                    |                        | modify                                 |
//! | catalog            | empty                  | Registered types and relationships     |
//! | persistence        | none                   | Durable adapter, recovered on open     |
//! | data_dir           | none                   | Directory for the file log             |
//! | instance_name      | `locusdb`              | Names the file log and log output      |
//! | trigger_listener   | none                   | Receives commit trigger batches        |
//! | immediate_triggers | false                  | Flag passed through to the listener    |
//!
//! ## Environment
//!
//! [`DatabaseBuilder::from_env`] seeds `instance_name` from
//! `LOCUSDB_INSTANCE_NAME` and `data_dir` from `LOCUSDB_DATA_DIR`. Values set
//! on the builder afterwards win.
//!
//! ## Persistence Selection
//!
//! An explicit `persistence(...)` adapter always wins. Otherwise, when a
//! `data_dir` is configured, the database logs to
//! `<data_dir>/<instance_name>.log` through [`LogPersistence`]. With neither,
//! the database is purely in-memory.
//!
//! ## Usage Examples
//!
//! ```ignore
//! let db = Database::builder()
//!     .heap_size(16 * 1024 * 1024)
//!     .persistence(MemoryPersistence::new())
//!     .open()?;
//! ```
//!
//! ```ignore
//! let db = DatabaseBuilder::from_env()
//!     .trigger_listener(|txn: u64, events: &[TriggerEvent], _immediate: bool| {
//!         println!("txn {txn}: {} events", events.len());
//!     })
//!     .open()?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::Mutex;

use super::commit::persistence_error;
use super::database::{Database, SharedDatabase};
use crate::catalog::Catalog;
use crate::config::{
    DEFAULT_HEAP_SIZE, DEFAULT_INSTANCE_NAME, DEFAULT_MAX_LOCATORS, DEFAULT_MAX_TXN_OBJECTS,
    DEFAULT_RECORD_RANGE_SIZE, ENV_DATA_DIR, ENV_INSTANCE_NAME, SLOT_SIZE,
};
use crate::memory::ObjectHeap;
use crate::mvcc::{RetiredList, TransactionManager};
use crate::persistence::{LogPersistence, PersistenceAdapter};
use crate::storage::{IdIndex, LocatorAllocator, LocatorTable, TypeIndex};
use crate::triggers::{ListenerSlot, TriggerListener};

/// Builder for configuring and opening a locusdb database.
///
/// Use `Database::builder()` to create a new builder, then chain configuration
/// methods before calling `open()` to create the database.
pub struct DatabaseBuilder {
    heap_size: Option<usize>,
    max_locators: Option<usize>,
    record_range_size: Option<usize>,
    max_txn_objects: Option<usize>,
    catalog: Option<Catalog>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    data_dir: Option<PathBuf>,
    instance_name: Option<String>,
    trigger_listener: Option<Box<dyn TriggerListener>>,
    immediate_triggers: bool,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    /// Creates a new DatabaseBuilder with default settings.
    pub fn new() -> Self {
        Self {
            heap_size: None,
            max_locators: None,
            record_range_size: None,
            max_txn_objects: None,
            catalog: None,
            persistence: None,
            data_dir: None,
            instance_name: None,
            trigger_listener: None,
            immediate_triggers: false,
        }
    }

    /// Creates a builder seeded from `LOCUSDB_INSTANCE_NAME` and
    /// `LOCUSDB_DATA_DIR`. Unset or empty variables are ignored.
    pub fn from_env() -> Self {
        let mut builder = Self::new();
        if let Some(name) = env_value(ENV_INSTANCE_NAME) {
            builder.instance_name = Some(name);
        }
        if let Some(dir) = env_value(ENV_DATA_DIR) {
            builder.data_dir = Some(PathBuf::from(dir));
        }
        builder
    }

    /// Sets the size of the object heap in bytes.
    ///
    /// Rounded down to a whole number of slots; must be at least
    /// `MIN_HEAP_SIZE`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let db = Database::builder()
    ///     .heap_size(16 * 1024 * 1024)
    ///     .open()?;
    /// ```
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = Some(bytes);
        self
    }

    /// Sets the locator table capacity, the most objects (live or awaiting
    /// reclamation) the database can hold.
    pub fn max_locators(mut self, count: usize) -> Self {
        self.max_locators = Some(count);
        self
    }

    pub fn record_range_size(mut self, entries: usize) -> Self {
        self.record_range_size = Some(entries);
        self
    }

    /// Sets how many distinct objects one transaction may modify before
    /// writes fail with `ObjectLimitExceeded`.
    pub fn max_txn_objects(mut self, count: usize) -> Self {
        self.max_txn_objects = Some(count);
        self
    }

    /// Starts the database with a pre-populated catalog.
    pub fn catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Logs every commit to `adapter` and recovers from it on open.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = MemoryPersistence::new();
    /// let db = Database::builder()
    ///     .persistence(store.clone())
    ///     .open()?;
    /// ```
    pub fn persistence(mut self, adapter: impl PersistenceAdapter + 'static) -> Self {
        self.persistence = Some(Arc::new(adapter));
        self
    }

    /// Directory for the file log. Ignored when an explicit adapter is set.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Registers the listener that receives commit trigger batches. Closures
    /// taking `(TxnId, &[TriggerEvent], bool)` qualify.
    pub fn trigger_listener(mut self, listener: impl TriggerListener + 'static) -> Self {
        self.trigger_listener = Some(Box::new(listener));
        self
    }

    /// Value of the `immediate` flag handed to the trigger listener.
    pub fn immediate_triggers(mut self, immediate: bool) -> Self {
        self.immediate_triggers = immediate;
        self
    }

    /// Returns the configured heap size, if any.
    pub fn get_heap_size(&self) -> Option<usize> {
        self.heap_size
    }

    /// Returns the configured data directory, if any.
    pub fn get_data_dir(&self) -> Option<&PathBuf> {
        self.data_dir.as_ref()
    }

    /// Returns the configured instance name, if any.
    pub fn get_instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    /// Creates the database and, with persistence configured, loads every
    /// persisted object.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A size setting is zero or the heap is smaller than `MIN_HEAP_SIZE`
    /// - The data directory or log file cannot be created
    /// - Recovery fails or the recovered data does not fit the heap or the
    ///   locator table
    pub fn open(self) -> Result<Database> {
        let max_locators = self.max_locators.unwrap_or(DEFAULT_MAX_LOCATORS);
        let record_range_size = self.record_range_size.unwrap_or(DEFAULT_RECORD_RANGE_SIZE);
        let max_txn_objects = self.max_txn_objects.unwrap_or(DEFAULT_MAX_TXN_OBJECTS);
        ensure!(max_locators > 0, "max_locators must be greater than 0");
        ensure!(record_range_size > 0, "record_range_size must be greater than 0");
        ensure!(max_txn_objects > 0, "max_txn_objects must be greater than 0");

        let instance_name = self
            .instance_name
            .unwrap_or_else(|| DEFAULT_INSTANCE_NAME.to_string());
        let heap_size = self.heap_size.unwrap_or(DEFAULT_HEAP_SIZE) / SLOT_SIZE * SLOT_SIZE;
        let heap = ObjectHeap::new(heap_size).wrap_err("failed to create object heap")?;

        let persistence = match (self.persistence, self.data_dir) {
            (Some(adapter), _) => Some(adapter),
            (None, Some(dir)) => {
                std::fs::create_dir_all(&dir)
                    .wrap_err_with(|| format!("failed to create data directory {:?}", dir))?;
                let path = dir.join(format!("{instance_name}.log"));
                let log = LogPersistence::open(&path)
                    .map_err(|e| persistence_error(e, &format!("opening {}", path.display())))?;
                Some(Arc::new(log) as Arc<dyn PersistenceAdapter>)
            }
            (None, None) => None,
        };

        let shared = SharedDatabase {
            instance_name,
            heap,
            locators: LocatorAllocator::new(max_locators),
            table: LocatorTable::new(max_locators),
            id_index: IdIndex::new(),
            type_index: TypeIndex::new(record_range_size),
            catalog: self.catalog.unwrap_or_default(),
            txn_manager: Arc::new(TransactionManager::new()),
            retired: RetiredList::new(),
            commit_lock: Mutex::new(()),
            persistence,
            listener: ListenerSlot(self.trigger_listener),
            immediate_triggers: self.immediate_triggers,
            max_txn_objects,
            sessions: Mutex::new(HashSet::new()),
            next_object_id: AtomicU64::new(1),
        };
        shared.recover().wrap_err("failed to recover database")?;

        tracing::info!(
            instance = %shared.instance_name,
            heap_size = shared.heap.size(),
            max_locators,
            persistent = shared.persistence.is_some(),
            "opened database"
        );
        Ok(Database::from_shared(shared))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_HEAP_SIZE;
    use tempfile::tempdir;

    #[test]
    fn builder_setters_record_values() {
        let builder = DatabaseBuilder::new()
            .heap_size(MIN_HEAP_SIZE)
            .data_dir("/tmp/locus")
            .instance_name("orders");

        assert_eq!(builder.get_heap_size(), Some(MIN_HEAP_SIZE));
        assert_eq!(builder.get_data_dir(), Some(&PathBuf::from("/tmp/locus")));
        assert_eq!(builder.get_instance_name(), Some("orders"));
    }

    #[test]
    fn builder_open_with_defaults() {
        let db = DatabaseBuilder::new().open().unwrap();
        assert_eq!(db.instance_name(), DEFAULT_INSTANCE_NAME);
        assert_eq!(db.stats().visible_ts, 1);
    }

    #[test]
    fn builder_rejects_tiny_heap() {
        assert!(DatabaseBuilder::new().heap_size(1024).open().is_err());
    }

    #[test]
    fn builder_rounds_heap_size_down_to_whole_slots() {
        let exact = DatabaseBuilder::new().heap_size(MIN_HEAP_SIZE).open().unwrap();
        let ragged = DatabaseBuilder::new()
            .heap_size(MIN_HEAP_SIZE + SLOT_SIZE - 1)
            .open()
            .unwrap();
        assert_eq!(ragged.stats().heap, exact.stats().heap);
    }

    #[test]
    fn builder_rejects_zero_sizes() {
        assert!(DatabaseBuilder::new().max_locators(0).open().is_err());
        assert!(DatabaseBuilder::new().record_range_size(0).open().is_err());
        assert!(DatabaseBuilder::new().max_txn_objects(0).open().is_err());
    }

    #[test]
    fn builder_data_dir_creates_instance_log() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");

        let db = DatabaseBuilder::new()
            .data_dir(&data_dir)
            .instance_name("orders")
            .open()
            .unwrap();

        assert!(data_dir.join("orders.log").exists());
        assert_eq!(db.instance_name(), "orders");
    }

    #[test]
    fn builder_from_env_reads_variables() {
        let dir = tempdir().unwrap();
        std::env::set_var(ENV_INSTANCE_NAME, "from-env");
        std::env::set_var(ENV_DATA_DIR, dir.path());

        let builder = DatabaseBuilder::from_env();
        std::env::remove_var(ENV_INSTANCE_NAME);
        std::env::remove_var(ENV_DATA_DIR);

        assert_eq!(builder.get_instance_name(), Some("from-env"));
        assert_eq!(builder.get_data_dir(), Some(&dir.path().to_path_buf()));

        let db = builder.instance_name("override").open().unwrap();
        assert_eq!(db.instance_name(), "override");
        assert!(dir.path().join("override.log").exists());
    }
}
