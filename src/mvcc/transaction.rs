//! # Transaction Management
//!
//! This module provides the transaction primitives shared by every session:
//! timestamp allocation, snapshot registration and the watermark used by the
//! epoch reclaimer.
//!
//! ## Timestamps
//!
//! Three monotonically increasing counters live in the manager:
//!
//! | Counter          | Meaning                                             |
//! |------------------|-----------------------------------------------------|
//! | `next_txn_id`    | Identity of a transaction, assigned at begin        |
//! | `commit_counter` | Last commit timestamp handed to a committer         |
//! | `visible_ts`     | Last commit timestamp whose versions are published  |
//!
//! `commit_counter` runs ahead of `visible_ts` only while a committer is
//! installing versions under the database commit lock. A new snapshot is
//! always taken from `visible_ts`, so it can never observe half of a commit.
//!
//! Special values:
//! - `ts = 0`: Reserved for bootstrapped (recovered) data, visible to everyone
//! - `ts = 1`: Initial `visible_ts`; the first commit gets timestamp 2
//!
//! ## Transaction States
//!
//! ```text
//! ┌─────────┐     commit()     ┌───────────┐
//! │ Active  │ ───────────────> │ Committed │
//! └─────────┘                  └───────────┘
//!      │
//!      │ rollback() / conflict / fatal error
//!      v
//! ┌─────────┐
//! │ Aborted │
//! └─────────┘
//! ```
//!
//! ## Slot Array
//!
//! Each slot holds the snapshot timestamp of an active transaction:
//! - Value 0: Slot is empty (available)
//! - Value > 0: Snapshot of the transaction holding the slot
//!
//! Slots are claimed and the watermark is computed under `slot_lock`. That
//! ordering matters: a transaction that registers after a watermark was
//! computed reads a `visible_ts` at least as large as that watermark, so the
//! reclaimer never frees a version a fresh snapshot still needs.
//!
//! ## Watermark Calculation
//!
//! The global watermark is the minimum of:
//! - `visible_ts`
//! - All non-zero values in `active_slots`
//!
//! A version superseded by a commit at or below the watermark is invisible to
//! every current and future snapshot.
//!
//! ## Safety Invariants
//!
//! 1. A transaction ID is never reused
//! 2. Slots are released on commit/rollback (enforced via Drop)
//! 3. Watermark is always <= visible_ts
//! 4. Only one transaction can hold a given slot

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

use crate::config::MAX_CONCURRENT_TXNS;

pub type TxnId = u64;

/// Commit timestamp given to versions loaded during recovery.
pub const BOOTSTRAP_TS: u64 = 0;

const INITIAL_VISIBLE_TS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

pub struct TransactionManager {
    pub(crate) next_txn_id: AtomicU64,
    pub(crate) commit_counter: AtomicU64,
    pub(crate) visible_ts: AtomicU64,
    pub(crate) active_slots: [AtomicU64; MAX_CONCURRENT_TXNS],
    pub(crate) slot_lock: Mutex<()>,
}

impl TransactionManager {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const INIT: AtomicU64 = AtomicU64::new(0);
        Self {
            next_txn_id: AtomicU64::new(1),
            commit_counter: AtomicU64::new(INITIAL_VISIBLE_TS),
            visible_ts: AtomicU64::new(INITIAL_VISIBLE_TS),
            #[allow(clippy::borrow_interior_mutable_const)]
            active_slots: [INIT; MAX_CONCURRENT_TXNS],
            slot_lock: Mutex::new(()),
        }
    }

    pub fn begin_txn(self: &Arc<Self>) -> Result<Transaction> {
        let _guard = self.slot_lock.lock();
        let snapshot_ts = self.visible_ts.load(Ordering::Acquire);
        for (idx, slot) in self.active_slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) == 0 {
                slot.store(snapshot_ts, Ordering::SeqCst);
                let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
                return Ok(Transaction::new(Arc::clone(self), id, snapshot_ts, idx));
            }
        }
        bail!(
            "too many concurrent transactions (max {})",
            MAX_CONCURRENT_TXNS
        )
    }

    pub(crate) fn release_slot(&self, slot_idx: usize) {
        self.active_slots[slot_idx].store(0, Ordering::SeqCst);
    }

    /// Hands out the next commit timestamp. Callers hold the commit lock and
    /// must follow up with [`publish`](Self::publish).
    pub fn next_commit_ts(&self) -> u64 {
        self.commit_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn publish(&self, commit_ts: u64) {
        debug_assert!(commit_ts > self.visible_ts.load(Ordering::Relaxed));
        self.visible_ts.store(commit_ts, Ordering::Release);
    }

    pub fn visible_ts(&self) -> u64 {
        self.visible_ts.load(Ordering::Acquire)
    }

    pub fn get_global_watermark(&self) -> u64 {
        let _guard = self.slot_lock.lock();
        let mut min_ts = self.visible_ts.load(Ordering::Acquire);
        for slot in &self.active_slots {
            let ts = slot.load(Ordering::Relaxed);
            if ts != 0 && ts < min_ts {
                min_ts = ts;
            }
        }
        min_ts
    }

    pub fn active_count(&self) -> usize {
        self.active_slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("visible_ts", &self.visible_ts())
            .field("active", &self.active_count())
            .finish()
    }
}

/// A registered snapshot. Dropping it without finishing releases its slot.
pub struct Transaction {
    id: TxnId,
    snapshot_ts: u64,
    slot_idx: usize,
    state: TxnState,
    manager: Arc<TransactionManager>,
    finished: bool,
}

impl Transaction {
    fn new(manager: Arc<TransactionManager>, id: TxnId, snapshot_ts: u64, slot_idx: usize) -> Self {
        Self {
            id,
            snapshot_ts,
            slot_idx,
            state: TxnState::Active,
            manager,
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn snapshot_ts(&self) -> u64 {
        self.snapshot_ts
    }

    pub fn slot_idx(&self) -> usize {
        self.slot_idx
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Ends the transaction in `state` and releases its slot.
    pub fn finish(mut self, state: TxnState) {
        debug_assert_ne!(state, TxnState::Active);
        self.state = state;
        self.finished = true;
        self.manager.release_slot(self.slot_idx);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.manager.release_slot(self.slot_idx);
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot_ts", &self.snapshot_ts)
            .field("slot_idx", &self.slot_idx)
            .field("state", &self.state)
            .finish()
    }
}
