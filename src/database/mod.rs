//! # Database Module
//!
//! This module provides the high-level API of locusdb: the [`Database`]
//! handle, its [`DatabaseBuilder`], and the per-thread [`Session`] through
//! which clients run transactions.
//!
//! ## Architecture
//!
//! The Database handle ties the lower layers together:
//! - Object heap and bitmap allocator ([`crate::memory`])
//! - Locator allocator, locator table, id index and record lists
//!   ([`crate::storage`])
//! - Timestamps, snapshot slots and epoch reclamation ([`crate::mvcc`])
//! - Types and relationships ([`crate::catalog`])
//! - Optional durable log ([`crate::persistence`]) and trigger listener
//!   ([`crate::triggers`])
//!
//! ## Transaction Pipeline
//!
//! ```text
//! begin_transaction()
//!     │  snapshot_ts = visible_ts, slot claimed
//!     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ 1. READ: id -> locator -> overlay or snapshot       │
//! │    version, copied out of the heap                  │
//! └─────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ 2. WRITE: fresh heap slots, recorded in the         │
//! │    private overlay; published state untouched       │
//! └─────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ 3. COMMIT: validate, persist, install versions,     │
//! │    publish visible_ts (commit lock held)            │
//! └─────────────────────────────────────────────────────┘
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────────────┐
//! │ 4. AFTER: trigger dispatch, reclamation of versions │
//! │    below the watermark                              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Thread Safety
//!
//! `Database` is `Send + Sync` and cheap to clone; clones share one instance.
//! `Session` is neither: it belongs to the thread that opened it, and a
//! thread can hold one session per database.
//!
//! ## Usage Example
//!
//! ```ignore
//! use locusdb::{Database, TypeMetadata};
//!
//! let db = Database::builder().open()?;
//! db.register_type(TypeMetadata::new(7, 0));
//!
//! let mut session = db.begin_session()?;
//! session.begin_transaction()?;
//! session.create_object(1, 7, b"hello")?;
//! session.commit_transaction()?;
//!
//! session.begin_transaction()?;
//! assert_eq!(session.get(1)?.payload, b"hello");
//! session.commit_transaction()?;
//! ```
//!
//! ## Module Organization
//!
//! - `builder`: configuration and open/recovery entry point
//! - `database`: the shared instance and its handle, stats and verification
//! - `session`: per-thread transaction control and object operations
//! - `transaction`: the private overlay of one open transaction
//! - `commit`: validation, persistence, publication, rollback, reclamation
//! - `references`: parent/child relationship maintenance
//! - `recovery`: rebuilding state from the persistence adapter

mod builder;
mod commit;
#[allow(clippy::module_inception)]
mod database;
mod recovery;
mod references;
mod session;
mod transaction;

pub use builder::DatabaseBuilder;
pub use database::{Database, DatabaseStats};
pub use session::Session;
