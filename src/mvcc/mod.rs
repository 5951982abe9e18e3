//! # Multi-Version Concurrency Control (MVCC)
//!
//! This module implements Snapshot Isolation (SI) for locusdb. Readers never
//! block writers and writers never block readers; conflicting writers are
//! detected at commit time and the later committer loses.
//!
//! ## Design Philosophy
//!
//! ### Optimistic, First-Committer-Wins
//!
//! - A transaction reads a consistent snapshot: the published state as of the
//!   `visible_ts` it observed at begin
//! - Writes go to a private overlay and fresh heap slots; nothing is shared
//!   until commit
//! - At commit, any object in the write-set whose newest committed version is
//!   newer than the snapshot aborts the transaction
//!
//! ### Version Storage: Copy-On-Write Slots
//!
//! Every version is an immutable slot run in the object heap. The locator
//! table keeps a short chain of `(commit_ts, offset)` per object:
//!
//! ```text
//!   locator 12                      ObjectHeap
//!   +---------------------+        +----------------------+
//!   | ts=3  off=1024  ----+------> | id=5 type=7 "hello"  |
//!   | ts=8  off=2048  ----+---+    +----------------------+
//!   +---------------------+   +--> | id=5 type=7 "world"  |
//!                                  +----------------------+
//! ```
//!
//! A snapshot at ts 5 reads "hello"; a snapshot at ts 8 or later reads
//! "world". Once the watermark passes 8 the first version is reclaimed.
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! begin() ─────> Active ─────> commit() ─────> Committed
//!                  │                              │
//!                  │                              v
//!                  └──> rollback() ───> Aborted   └──> Versions visible
//! ```
//!
//! ## Visibility Rules (Snapshot Isolation)
//!
//! A version V is visible to transaction T if:
//! 1. V.commit_ts <= T.snapshot_ts
//! 2. No other version V' of the same object has
//!    V.commit_ts < V'.commit_ts <= T.snapshot_ts
//! 3. V is not a tombstone
//!
//! A transaction additionally sees its own uncommitted writes.
//!
//! ## Garbage Collection
//!
//! See [`gc`]. Reclamation runs after every commit and rollback and only
//! touches versions older than the global watermark.

pub mod gc;
pub mod transaction;

pub use gc::{GcStats, RetiredList};
pub use transaction::{Transaction, TransactionManager, TxnId, TxnState, BOOTSTRAP_TS};
