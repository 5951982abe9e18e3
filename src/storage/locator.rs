//! # Locators
//!
//! This module holds the three structures that turn an object id into a heap
//! offset: the allocator that hands out locators, the versioned locator table,
//! and the id index.
//!
//! ## Locator Allocation
//!
//! Locators are dense and 1-based. Released locators join a FIFO queue and
//! are handed out again, in release order, before any never-used locator:
//!
//! ```text
//! allocate x3      -> 1, 2, 3          free = []          next = 4
//! release 2, 1     ->                  free = [2, 1]
//! allocate x3      -> 2, 1, 4          free = []          next = 5
//! ```
//!
//! The allocator refuses to go past the table capacity with
//! `SystemObjectLimitExceeded`.
//!
//! ## Version Chains
//!
//! Each table entry is a short chain of `(commit_ts, offset)` versions in
//! ascending timestamp order. Offset 0 is a tombstone: the object is deleted
//! as of that timestamp.
//!
//! ```text
//! locator 7:  [ts=3 off=640] [ts=9 off=1280] [ts=12 off=0]
//!                   ^ snapshot 5 sees this        ^ snapshot 12+ sees "deleted"
//! ```
//!
//! Entries are guarded by one `RwLock` each so that readers of different
//! objects never contend. Chains are appended to by the committer (under the
//! database commit lock) and trimmed by the reclaimer in [`crate::mvcc::gc`].

use std::collections::VecDeque;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use super::{Locator, ObjectId, TypeId, INVALID_LOCATOR};
use crate::error::DbError;
use crate::memory::HeapOffset;

#[derive(Debug)]
struct AllocatorState {
    free: VecDeque<Locator>,
    next: Locator,
}

#[derive(Debug)]
pub struct LocatorAllocator {
    state: Mutex<AllocatorState>,
    capacity: usize,
}

impl LocatorAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                free: VecDeque::new(),
                next: 1,
            }),
            capacity,
        }
    }

    pub fn allocate_locator(&self) -> Result<Locator> {
        let mut state = self.state.lock();
        if let Some(locator) = state.free.pop_front() {
            return Ok(locator);
        }
        if state.next as usize > self.capacity {
            return Err(DbError::SystemObjectLimitExceeded { max: self.capacity }.into());
        }
        let locator = state.next;
        state.next += 1;
        Ok(locator)
    }

    pub fn release_locator(&self, locator: Locator) {
        debug_assert_ne!(locator, INVALID_LOCATOR);
        let mut state = self.state.lock();
        debug_assert!(locator < state.next, "releasing a locator that was never allocated");
        debug_assert!(!state.free.contains(&locator), "double release of locator {locator}");
        state.free.push_back(locator);
    }

    /// Number of locators currently handed out.
    pub fn allocated_count(&self) -> usize {
        let state = self.state.lock();
        (state.next - 1) as usize - state.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One committed version of an object.
///
/// Tombstones keep the id and type of the object they delete so that the
/// reclaimer can unlink it from the id index and its type's record list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorVersion {
    pub commit_ts: u64,
    pub offset: HeapOffset,
    pub len: u32,
    pub id: ObjectId,
    pub type_id: TypeId,
}

impl LocatorVersion {
    pub fn is_tombstone(&self) -> bool {
        self.offset == 0
    }
}

type VersionChain = SmallVec<[LocatorVersion; 2]>;

/// Result of trimming one version chain.
#[derive(Debug, Default)]
pub struct Pruned {
    /// Versions no snapshot can see any more. Their heap slots can be freed.
    pub dropped: VersionChain,
    /// Set when the chain ended in a tombstone that is now the only version
    /// anybody can see: the locator itself is dead.
    pub released: Option<LocatorVersion>,
}

pub struct LocatorTable {
    entries: Box<[RwLock<VersionChain>]>,
}

impl LocatorTable {
    pub fn new(capacity: usize) -> Self {
        // Index 0 is INVALID_LOCATOR and stays empty.
        let entries = (0..=capacity).map(|_| RwLock::new(VersionChain::new())).collect();
        Self { entries }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len() - 1
    }

    fn entry(&self, locator: Locator) -> &RwLock<VersionChain> {
        assert!(
            locator != INVALID_LOCATOR && (locator as usize) < self.entries.len(),
            "locator {} out of range (capacity {})",
            locator,
            self.capacity()
        );
        &self.entries[locator as usize]
    }

    /// Newest version at or below `snapshot_ts`, tombstones included.
    pub fn visible(&self, locator: Locator, snapshot_ts: u64) -> Option<LocatorVersion> {
        self.entry(locator)
            .read()
            .iter()
            .rev()
            .find(|v| v.commit_ts <= snapshot_ts)
            .copied()
    }

    /// Like [`visible`](Self::visible) but treats tombstones as absent.
    pub fn lookup(&self, locator: Locator, snapshot_ts: u64) -> Option<LocatorVersion> {
        self.visible(locator, snapshot_ts)
            .filter(|v| !v.is_tombstone())
    }

    pub fn latest(&self, locator: Locator) -> Option<LocatorVersion> {
        self.entry(locator).read().last().copied()
    }

    pub fn version_count(&self, locator: Locator) -> usize {
        self.entry(locator).read().len()
    }

    pub fn install(&self, locator: Locator, version: LocatorVersion) {
        let mut chain = self.entry(locator).write();
        debug_assert!(
            chain.last().map_or(true, |v| v.commit_ts < version.commit_ts),
            "versions must be installed in commit order"
        );
        chain.push(version);
    }

    /// Drops every version hidden behind a newer one at or below `watermark`.
    pub fn prune(&self, locator: Locator, watermark: u64) -> Pruned {
        let mut chain = self.entry(locator).write();
        let Some(keep_from) = chain.iter().rposition(|v| v.commit_ts <= watermark) else {
            return Pruned::default();
        };

        let dropped = chain.drain(..keep_from).collect();
        let released = if chain.len() == 1 && chain[0].is_tombstone() {
            chain.pop()
        } else {
            None
        };
        Pruned { dropped, released }
    }

    /// Calls `f` with the newest committed version of every live locator.
    pub fn for_each_latest(&self, mut f: impl FnMut(Locator, &LocatorVersion)) {
        for (index, entry) in self.entries.iter().enumerate().skip(1) {
            if let Some(version) = entry.read().last() {
                f(index as Locator, version);
            }
        }
    }

    pub fn total_versions(&self) -> usize {
        self.entries.iter().map(|e| e.read().len()).sum()
    }
}

impl std::fmt::Debug for LocatorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorTable")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Maps client object ids to locators.
///
/// An id is bound from the moment a transaction creates it until the object is
/// reclaimed, so two transactions can never create the same id concurrently.
#[derive(Debug, Default)]
pub struct IdIndex {
    map: RwLock<HashMap<ObjectId, Locator>>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectId) -> Option<Locator> {
        self.map.read().get(&id).copied()
    }

    pub fn try_insert(&self, id: ObjectId, locator: Locator) -> Result<()> {
        let mut map = self.map.write();
        if map.contains_key(&id) {
            return Err(DbError::DuplicateObjectId(id).into());
        }
        map.insert(id, locator);
        Ok(())
    }

    /// Removes `id` only if it is still bound to `locator`.
    pub fn remove(&self, id: ObjectId, locator: Locator) -> bool {
        let mut map = self.map.write();
        if map.get(&id) == Some(&locator) {
            map.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_id(&self) -> Option<ObjectId> {
        self.map.read().keys().copied().max()
    }
}
