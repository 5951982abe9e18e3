//! # Database Handle
//!
//! [`Database`] is a cheap, cloneable handle over a [`SharedDatabase`], which
//! owns every shared structure of one database instance. Nothing is global:
//! two databases opened in the same process share no state.
//!
//! ## Ownership
//!
//! ```text
//! Database (Clone) ──Arc──> SharedDatabase
//!                            ├── heap          ObjectHeap (anonymous mapping)
//!                            ├── locators      LocatorAllocator
//!                            ├── table         LocatorTable (version chains)
//!                            ├── id_index      ObjectId -> Locator
//!                            ├── type_index    TypeId -> RecordList
//!                            ├── catalog       types and relationships
//!                            ├── txn_manager   timestamps, snapshot slots
//!                            ├── retired       versions awaiting reclamation
//!                            ├── commit_lock   serializes commits and GC
//!                            ├── persistence   optional durable log
//!                            └── listener      optional trigger listener
//! ```
//!
//! ## Sessions
//!
//! Each client thread opens at most one [`Session`]. The registry caps the
//! number of open sessions at `MAX_SESSIONS`, which equals the number of
//! transaction slots, so `begin_transaction` never runs out of slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use eyre::Result;
use hashbrown::HashSet;
use parking_lot::Mutex;

use super::builder::DatabaseBuilder;
use super::session::Session;
use super::transaction::PrivateVersion;
use crate::catalog::{Catalog, Relationship, TypeMetadata};
use crate::config::MAX_SESSIONS;
use crate::error::DbError;
use crate::memory::{HeapStats, ObjectHeap};
use crate::mvcc::{GcStats, RetiredList, TransactionManager};
use crate::persistence::PersistenceAdapter;
use crate::storage::{
    IdIndex, Locator, LocatorAllocator, LocatorTable, LocatorVersion, ObjectId, ObjectRecord,
    TypeIndex, INVALID_OBJECT_ID,
};
use crate::triggers::ListenerSlot;

pub(crate) struct SharedDatabase {
    pub(crate) instance_name: String,
    pub(crate) heap: ObjectHeap,
    pub(crate) locators: LocatorAllocator,
    pub(crate) table: LocatorTable,
    pub(crate) id_index: IdIndex,
    pub(crate) type_index: TypeIndex,
    pub(crate) catalog: Catalog,
    pub(crate) txn_manager: Arc<TransactionManager>,
    pub(crate) retired: RetiredList,
    pub(crate) commit_lock: Mutex<()>,
    pub(crate) persistence: Option<Arc<dyn PersistenceAdapter>>,
    pub(crate) listener: ListenerSlot,
    pub(crate) immediate_triggers: bool,
    pub(crate) max_txn_objects: usize,
    pub(crate) sessions: Mutex<HashSet<ThreadId>>,
    pub(crate) next_object_id: AtomicU64,
}

impl SharedDatabase {
    /// Reads a published version.
    pub(crate) fn read_version(&self, version: &LocatorVersion) -> Result<ObjectRecord> {
        debug_assert!(!version.is_tombstone());
        // SAFETY: the caller resolved `version` through a registered snapshot
        // (or holds the commit lock), so the reclaimer cannot free it yet.
        let bytes = unsafe { self.heap.read(version.offset, version.len as usize)? };
        ObjectRecord::from_heap_bytes(&bytes)
    }

    pub(crate) fn read_private(&self, version: PrivateVersion) -> Result<ObjectRecord> {
        // SAFETY: private versions are only reachable from the overlay that
        // allocated them.
        let bytes = unsafe { self.heap.read(version.offset, version.len as usize)? };
        ObjectRecord::from_heap_bytes(&bytes)
    }

    pub(crate) fn store_private(&self, record: &ObjectRecord) -> Result<PrivateVersion> {
        let bytes = record.to_heap_bytes();
        let offset = self.heap.allocate(bytes.len())?;
        // SAFETY: freshly allocated, no other thread knows the offset.
        if let Err(e) = unsafe { self.heap.write(offset, &bytes) } {
            if let Err(free) = self.heap.free(offset, bytes.len()) {
                tracing::warn!(offset, error = %free, "failed to free unwritten version");
            }
            return Err(e);
        }
        Ok(PrivateVersion {
            offset,
            len: bytes.len() as u32,
        })
    }

    pub(crate) fn free_private(&self, version: PrivateVersion) {
        if let Err(e) = self.heap.free(version.offset, version.len as usize) {
            tracing::warn!(offset = version.offset, error = %e, "failed to free private version");
        }
    }

    /// Moves the id generator past `id` so `generate_id` never hands it out.
    pub(crate) fn observe_object_id(&self, id: ObjectId) {
        self.next_object_id
            .fetch_max(id.saturating_add(1), Ordering::Relaxed);
    }

    pub(crate) fn register_session(&self, thread: ThreadId) -> Result<()> {
        let mut sessions = self.sessions.lock();
        if sessions.contains(&thread) {
            return Err(DbError::SessionExists.into());
        }
        if sessions.len() >= MAX_SESSIONS {
            return Err(DbError::SessionLimitExceeded { max: MAX_SESSIONS }.into());
        }
        sessions.insert(thread);
        Ok(())
    }

    pub(crate) fn unregister_session(&self, thread: ThreadId) {
        self.sessions.lock().remove(&thread);
    }
}

/// Point-in-time counters for one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub visible_ts: u64,
    pub active_transactions: usize,
    pub open_sessions: usize,
    pub heap: HeapStats,
    pub allocated_locators: usize,
    pub live_ids: usize,
    pub versions: usize,
    pub retired_versions: usize,
    pub indexed_types: usize,
}

#[derive(Clone)]
pub struct Database {
    pub(crate) shared: Arc<SharedDatabase>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    pub(crate) fn from_shared(shared: SharedDatabase) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.shared.instance_name
    }

    /// Opens a session bound to the calling thread.
    pub fn begin_session(&self) -> Result<Session> {
        Session::open(self.clone())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn register_type(&self, metadata: TypeMetadata) {
        self.shared.catalog.register_type(metadata);
    }

    pub fn add_relationship(&self, relationship: Relationship) -> Result<()> {
        self.shared.catalog.add_relationship(relationship)
    }

    /// Returns an object id no committed or recovered object uses.
    ///
    /// The generator runs ahead of every id a transaction has created, and
    /// skips ids that are still bound in the id index after it wraps.
    pub fn generate_id(&self) -> ObjectId {
        let shared = &self.shared;
        loop {
            let id = shared.next_object_id.fetch_add(1, Ordering::Relaxed);
            if id != INVALID_OBJECT_ID && shared.id_index.get(id).is_none() {
                return id;
            }
        }
    }

    /// Frees every retired version no snapshot can see any more.
    pub fn collect_garbage(&self) -> GcStats {
        self.shared.collect_garbage()
    }

    /// Removes tombstoned entries from every type's record list.
    pub fn compact_record_lists(&self) -> usize {
        self.shared.type_index.compact_all()
    }

    pub fn stats(&self) -> DatabaseStats {
        let shared = &self.shared;
        DatabaseStats {
            visible_ts: shared.txn_manager.visible_ts(),
            active_transactions: shared.txn_manager.active_count(),
            open_sessions: shared.sessions.lock().len(),
            heap: shared.heap.stats(),
            allocated_locators: shared.locators.allocated_count(),
            live_ids: shared.id_index.len(),
            versions: shared.table.total_versions(),
            retired_versions: shared.retired.len(),
            indexed_types: shared.type_index.type_ids().len(),
        }
    }

    /// Cross-checks every newest committed version against the object it
    /// points at and returns how many live objects were checked.
    pub fn verify(&self) -> Result<usize> {
        let shared = &self.shared;
        let _commit = shared.commit_lock.lock();

        let mut latest: Vec<(Locator, LocatorVersion)> = Vec::new();
        shared
            .table
            .for_each_latest(|locator, version| latest.push((locator, *version)));

        let mut checked = 0;
        for (locator, version) in latest {
            if version.is_tombstone() {
                continue;
            }
            if !shared.heap.is_allocated(version.offset) {
                return Err(DbError::Corrupted(format!(
                    "locator {locator} points at unallocated offset {}",
                    version.offset
                ))
                .into());
            }
            let record = shared.read_version(&version)?;
            if record.locator != locator || record.id != version.id || record.type_id != version.type_id
            {
                return Err(DbError::Corrupted(format!(
                    "locator {locator} (id {}, type {}) points at object with locator {} (id {}, type {})",
                    version.id, version.type_id, record.locator, record.id, record.type_id
                ))
                .into());
            }
            if shared.id_index.get(version.id) != Some(locator) {
                return Err(DbError::Corrupted(format!(
                    "id {} is not indexed to locator {locator}",
                    version.id
                ))
                .into());
            }
            checked += 1;
        }
        Ok(checked)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("instance_name", &self.shared.instance_name)
            .field("txn_manager", &self.shared.txn_manager)
            .field("heap", &self.shared.heap)
            .field("persistent", &self.shared.persistence.is_some())
            .field("listener", &self.shared.listener)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::db_error;

    fn open() -> Database {
        let db = Database::builder().heap_size(1 << 20).open().unwrap();
        db.register_type(TypeMetadata::new(7, 0));
        db
    }

    #[test]
    fn second_session_on_same_thread_is_rejected() {
        let db = open();
        let _session = db.begin_session().unwrap();
        let err = db.begin_session().unwrap_err();
        assert_eq!(db_error(&err), Some(&DbError::SessionExists));
    }

    #[test]
    fn ending_a_session_frees_the_thread() {
        let db = open();
        let session = db.begin_session().unwrap();
        session.end().unwrap();
        assert!(db.begin_session().is_ok());
    }

    #[test]
    fn session_limit_is_enforced() {
        let db = open();
        let registered: Vec<ThreadId> = (0..MAX_SESSIONS)
            .map(|_| std::thread::spawn(|| std::thread::current().id()).join().unwrap())
            .collect();
        for thread in &registered {
            db.shared.register_session(*thread).unwrap();
        }

        let err = db.begin_session().unwrap_err();
        assert_eq!(
            db_error(&err),
            Some(&DbError::SessionLimitExceeded { max: MAX_SESSIONS })
        );

        db.shared.unregister_session(registered[0]);
        assert!(db.begin_session().is_ok());
    }

    #[test]
    fn stats_track_objects_and_versions() {
        let db = open();
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, 7, b"hello").unwrap();
        session.commit_transaction().unwrap();

        let stats = db.stats();
        assert_eq!(stats.visible_ts, 2);
        assert_eq!(stats.live_ids, 1);
        assert_eq!(stats.versions, 1);
        assert_eq!(stats.open_sessions, 1);
        assert_eq!(stats.active_transactions, 0);
        assert_eq!(stats.heap.used_slots, 1);
        assert_eq!(stats.indexed_types, 1);
    }

    #[test]
    fn verify_checks_every_live_object() {
        let db = open();
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        for id in 1..=3 {
            session.create_object(id, 7, b"x").unwrap();
        }
        session.commit_transaction().unwrap();

        session.begin_transaction().unwrap();
        session.delete_object(2).unwrap();
        session.commit_transaction().unwrap();

        assert_eq!(db.verify().unwrap(), 2);
    }

    #[test]
    fn generated_ids_are_unique() {
        let db = open();
        let a = db.generate_id();
        let b = db.generate_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }

    #[test]
    fn generated_ids_skip_client_chosen_ids() {
        let db = open();
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, 7, b"a").unwrap();
        session.create_object(5, 7, b"b").unwrap();
        session.commit_transaction().unwrap();

        let id = db.generate_id();
        assert!(id > 5, "generated id {id} collides with a created id");

        session.begin_transaction().unwrap();
        session.create_object(id, 7, b"c").unwrap();
        session.commit_transaction().unwrap();
        assert_eq!(db.stats().live_ids, 3);
    }

    #[test]
    fn generator_skips_bound_ids_after_wrapping() {
        let db = open();
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, 7, b"low").unwrap();
        session.create_object(u64::MAX, 7, b"high").unwrap();
        session.commit_transaction().unwrap();

        // Saturated at u64::MAX: the next ids wrap past 0 and the bound id 1.
        assert_eq!(db.generate_id(), 2);
    }

    #[test]
    fn databases_do_not_share_state() {
        let a = open();
        let b = open();
        let mut session = a.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, 7, b"a").unwrap();
        session.commit_transaction().unwrap();

        assert_eq!(a.stats().live_ids, 1);
        assert_eq!(b.stats().live_ids, 0);
    }
}
