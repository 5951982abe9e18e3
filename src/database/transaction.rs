//! # Transaction Overlay
//!
//! An [`ActiveTransaction`] is the private state of one open transaction: its
//! registered snapshot, the write-set and the trigger events produced so far.
//!
//! ## Write-Set
//!
//! ```text
//!   writes: Locator -> WriteEntry
//!   ┌─────────┬────┬──────┬─────────┬───────────────────────┐
//!   │ locator │ id │ type │ existed │ version               │
//!   ├─────────┼────┼──────┼─────────┼───────────────────────┤
//!   │ 12      │ 5  │ 7    │ true    │ Some(off=4096,len=29) │  update
//!   │ 13      │ 9  │ 3    │ true    │ None                  │  delete
//!   │ 40      │ 77 │ 7    │ false   │ Some(off=4160,len=24) │  create
//!   └─────────┴────┴──────┴─────────┴───────────────────────┘
//! ```
//!
//! `existed` records whether a committed version was visible at the snapshot.
//! Only those entries take part in conflict detection and retirement at
//! commit. Entries with `existed == false` own a locator and an id binding
//! that nobody else can see until commit.
//!
//! Every write allocates a fresh slot run in the heap and copies the object
//! there. A private version replaced by a later write in the same transaction
//! is freed immediately: no other snapshot can have seen it.
//!
//! ## Reads
//!
//! ```text
//!   id ──id_index──> locator ──overlay?──> private version
//!                            └──table.lookup(snapshot)──> published version
//! ```
//!
//! Ids stay bound in the id index until the reclaimer releases a deleted
//! object, so the id of any object this snapshot can see still resolves to
//! the same locator.
//!
//! ## Fatal Errors
//!
//! `OutOfMemory` leaves the overlay consistent (nothing was changed), but it
//! aborts the transaction anyway; the session performs the rollback.

use eyre::Result;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use smallvec::{smallvec, SmallVec};

use super::database::SharedDatabase;
use crate::error::DbError;
use crate::memory::HeapOffset;
use crate::mvcc::{Transaction, TxnId, TxnState};
use crate::storage::{
    Locator, LocatorVersion, ObjectId, ObjectRecord, RecordIterator, TypeId, INVALID_OBJECT_ID,
};
use crate::triggers::{EventType, TriggerEvent};

/// A heap copy written by this transaction and not yet published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrivateVersion {
    pub(crate) offset: HeapOffset,
    pub(crate) len: u32,
}

#[derive(Debug)]
pub(crate) struct WriteEntry {
    pub(crate) id: ObjectId,
    pub(crate) type_id: TypeId,
    pub(crate) existed: bool,
    /// `None` once the object is deleted by this transaction.
    pub(crate) version: Option<PrivateVersion>,
}

pub(crate) struct ActiveTransaction {
    txn: Transaction,
    writes: HashMap<Locator, WriteEntry>,
    order: Vec<Locator>,
    events: Vec<TriggerEvent>,
}

impl ActiveTransaction {
    pub(crate) fn new(txn: Transaction) -> Self {
        Self {
            txn,
            writes: HashMap::new(),
            order: Vec::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn id(&self) -> TxnId {
        self.txn.id()
    }

    pub(crate) fn snapshot_ts(&self) -> u64 {
        self.txn.snapshot_ts()
    }

    pub(crate) fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Write-set entries in the order their objects were first touched.
    pub(crate) fn writes_in_order(&self) -> impl Iterator<Item = (Locator, &WriteEntry)> + '_ {
        self.order
            .iter()
            .filter_map(move |locator| self.writes.get(locator).map(|entry| (*locator, entry)))
    }

    pub(crate) fn take_events(&mut self) -> Vec<TriggerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Empties the write-set, handing back every entry.
    pub(crate) fn drain_writes(&mut self) -> Vec<(Locator, WriteEntry)> {
        let mut writes = std::mem::take(&mut self.writes);
        self.order
            .drain(..)
            .filter_map(|locator| writes.remove(&locator).map(|entry| (locator, entry)))
            .collect()
    }

    pub(crate) fn finish(self, state: TxnState) {
        debug_assert!(self.writes.is_empty() || state == TxnState::Committed);
        self.txn.finish(state);
    }

    fn existed_at_snapshot(&self, locator: Locator) -> bool {
        self.writes.get(&locator).map_or(true, |entry| entry.existed)
    }

    fn check_limit(&self, db: &SharedDatabase, locator: Locator) -> Result<()> {
        self.reserve(db, &[locator])
    }

    /// Fails with `ObjectLimitExceeded` unless all of `locators` can join the
    /// write-set. Lets multi-object updates fail before changing anything.
    pub(crate) fn reserve(&self, db: &SharedDatabase, locators: &[Locator]) -> Result<()> {
        let mut new: SmallVec<[Locator; 4]> = SmallVec::new();
        for locator in locators {
            if !self.writes.contains_key(locator) && !new.contains(locator) {
                new.push(*locator);
            }
        }
        if self.writes.len() + new.len() > db.max_txn_objects {
            return Err(DbError::ObjectLimitExceeded {
                max: db.max_txn_objects,
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn resolve_locator(
        &self,
        db: &SharedDatabase,
        locator: Locator,
    ) -> Result<Option<ObjectRecord>> {
        if let Some(entry) = self.writes.get(&locator) {
            return entry
                .version
                .map(|version| db.read_private(version))
                .transpose();
        }
        db.table
            .lookup(locator, self.snapshot_ts())
            .map(|version| db.read_version(&version))
            .transpose()
    }

    pub(crate) fn resolve(&self, db: &SharedDatabase, id: ObjectId) -> Result<Option<ObjectRecord>> {
        match db.id_index.get(id) {
            Some(locator) => self.resolve_locator(db, locator),
            None => Ok(None),
        }
    }

    pub(crate) fn get(&self, db: &SharedDatabase, id: ObjectId) -> Result<ObjectRecord> {
        if id == INVALID_OBJECT_ID {
            return Err(DbError::InvalidObjectId(id).into());
        }
        self.resolve(db, id)?
            .ok_or_else(|| DbError::ObjectNotFound(id).into())
    }

    /// Copies `record` into a fresh heap slot run and makes it the private
    /// version of its locator.
    pub(crate) fn write(&mut self, db: &SharedDatabase, record: &ObjectRecord) -> Result<()> {
        self.check_limit(db, record.locator)?;
        let existed = self.existed_at_snapshot(record.locator);
        let version = db.store_private(record)?;

        match self.writes.entry(record.locator) {
            Entry::Occupied(mut occupied) => {
                if let Some(previous) = occupied.get_mut().version.replace(version) {
                    db.free_private(previous);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(WriteEntry {
                    id: record.id,
                    type_id: record.type_id,
                    existed,
                    version: Some(version),
                });
                self.order.push(record.locator);
            }
        }
        Ok(())
    }

    pub(crate) fn create_object(
        &mut self,
        db: &SharedDatabase,
        id: ObjectId,
        type_id: TypeId,
        payload: &[u8],
    ) -> Result<Locator> {
        if id == INVALID_OBJECT_ID {
            return Err(DbError::InvalidObjectId(id).into());
        }
        let reference_count = db.catalog.reference_count(type_id)? as usize;
        ObjectRecord::check_size(reference_count, payload.len())?;

        if let Some(locator) = db.id_index.get(id) {
            // Deleted earlier in this transaction: the create revives it.
            let revivable = self.writes.get(&locator).is_some_and(|entry| {
                entry.existed && entry.version.is_none() && entry.type_id == type_id
            });
            if !revivable {
                return Err(DbError::DuplicateObjectId(id).into());
            }
            let record = ObjectRecord {
                locator,
                id,
                type_id,
                references: smallvec![INVALID_OBJECT_ID; reference_count],
                payload: payload.to_vec(),
            };
            self.write(db, &record)?;
            self.events
                .push(TriggerEvent::row(EventType::RowInsert, type_id, id));
            return Ok(locator);
        }

        if self.writes.len() >= db.max_txn_objects {
            return Err(DbError::ObjectLimitExceeded {
                max: db.max_txn_objects,
            }
            .into());
        }

        let locator = db.locators.allocate_locator()?;
        if let Err(e) = db.id_index.try_insert(id, locator) {
            db.locators.release_locator(locator);
            return Err(e);
        }
        db.observe_object_id(id);

        let record = ObjectRecord {
            locator,
            id,
            type_id,
            references: smallvec![INVALID_OBJECT_ID; reference_count],
            payload: payload.to_vec(),
        };
        // Not in the write-set yet, so write() would count it as existing.
        let stored = db.store_private(&record).map(|version| {
            self.writes.insert(
                locator,
                WriteEntry {
                    id,
                    type_id,
                    existed: false,
                    version: Some(version),
                },
            );
            self.order.push(locator);
        });
        if let Err(e) = stored {
            db.id_index.remove(id, locator);
            db.locators.release_locator(locator);
            return Err(e);
        }

        self.events
            .push(TriggerEvent::row(EventType::RowInsert, type_id, id));
        Ok(locator)
    }

    pub(crate) fn update_payload(
        &mut self,
        db: &SharedDatabase,
        id: ObjectId,
        payload: &[u8],
    ) -> Result<()> {
        let current = self.get(db, id)?;
        ObjectRecord::check_size(current.references.len(), payload.len())?;

        let changed = db
            .catalog
            .changed_fields(current.type_id, &current.payload, payload);
        let record = ObjectRecord {
            payload: payload.to_vec(),
            ..current
        };
        self.write(db, &record)?;
        self.events
            .push(TriggerEvent::update(record.type_id, id, changed));
        Ok(())
    }

    /// Writes a new version whose reference slots differ from the current
    /// one. Reference changes produce no trigger events.
    pub(crate) fn update_references(
        &mut self,
        db: &SharedDatabase,
        record: &ObjectRecord,
    ) -> Result<()> {
        self.write(db, record)
    }

    pub(crate) fn delete_object(&mut self, db: &SharedDatabase, id: ObjectId) -> Result<()> {
        let current = self.get(db, id)?;
        if current.references.iter().any(|&r| r != INVALID_OBJECT_ID) {
            return Err(DbError::ObjectStillReferenced {
                id,
                type_id: current.type_id,
            }
            .into());
        }

        let locator = current.locator;
        match self.writes.get_mut(&locator) {
            Some(entry) => {
                if let Some(previous) = entry.version.take() {
                    db.free_private(previous);
                }
                if !entry.existed {
                    // Never published: forget it entirely.
                    self.writes.remove(&locator);
                    self.order.retain(|&l| l != locator);
                    db.id_index.remove(id, locator);
                    db.locators.release_locator(locator);
                }
            }
            None => {
                self.check_limit(db, locator)?;
                self.writes.insert(
                    locator,
                    WriteEntry {
                        id,
                        type_id: current.type_id,
                        existed: true,
                        version: None,
                    },
                );
                self.order.push(locator);
            }
        }

        self.events
            .push(TriggerEvent::row(EventType::RowDelete, current.type_id, id));
        Ok(())
    }

    /// Every object of `type_id` visible to this transaction: committed ones
    /// in record-list order, then the ones created by this transaction.
    pub(crate) fn scan_type(
        &self,
        db: &SharedDatabase,
        type_id: TypeId,
    ) -> Result<Vec<ObjectRecord>> {
        let mut objects = Vec::new();

        if let Some(list) = db.type_index.get(type_id) {
            let mut iterator = RecordIterator::new();
            let mut more = list.start(&mut iterator);
            while more {
                let data = list.get_record_data(&iterator);
                if !data.deleted {
                    if let Some(record) = self.resolve_locator(db, data.locator)? {
                        if record.type_id == type_id {
                            objects.push(record);
                        }
                    }
                }
                more = list.move_next(&mut iterator);
            }
        }

        for (_, entry) in self.writes_in_order() {
            if entry.existed || entry.type_id != type_id {
                continue;
            }
            if let Some(version) = entry.version {
                objects.push(db.read_private(version)?);
            }
        }
        Ok(objects)
    }

    /// Newest published version for every write-set entry that existed at
    /// the snapshot, paired with its locator.
    pub(crate) fn committed_bases<'a>(
        &'a self,
        db: &'a SharedDatabase,
    ) -> impl Iterator<Item = (Locator, Option<LocatorVersion>)> + 'a {
        self.writes_in_order()
            .filter(|(_, entry)| entry.existed)
            .map(move |(locator, _)| (locator, db.table.latest(locator)))
    }
}

impl std::fmt::Debug for ActiveTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTransaction")
            .field("txn", &self.txn)
            .field("writes", &self.writes.len())
            .field("events", &self.events.len())
            .finish()
    }
}
