//! # locusdb - Memory-Resident Object Database
//!
//! locusdb is an in-process object database: client threads create, read,
//! update and delete variable-length binary objects under snapshot-isolated
//! transactions. Objects live in a shared anonymous memory heap and are
//! reached through a level of indirection, the locator, so that a new version
//! can be published by swapping one table entry.
//!
//! - **Snapshot isolation**: readers never block writers and never see a
//!   partial commit
//! - **First committer wins**: conflicting writers are detected at commit
//! - **Optional durability**: commits can be logged through a persistence
//!   adapter and replayed on open
//! - **Commit triggers**: a listener receives the row events of each commit
//!
//! ## Quick Start
//!
//! ```ignore
//! use locusdb::{Database, TypeMetadata};
//!
//! let db = Database::builder()
//!     .heap_size(16 * 1024 * 1024)
//!     .open()?;
//! db.register_type(TypeMetadata::new(7, 0));
//!
//! let mut session = db.begin_session()?;
//! session.begin_transaction()?;
//! session.create_object(1, 7, b"hello")?;
//! session.commit_transaction()?;
//! ```
//!
//! ## Architecture
//!
//! locusdb uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Database / Session)   │
//! ├─────────────────────────────────────┤
//! │  Transaction overlay │   Triggers   │
//! ├──────────────────────┼──────────────┤
//! │ MVCC (timestamps,    │   Catalog    │
//! │ snapshots, reclaim)  │              │
//! ├─────────────────────────────────────┤
//! │ Locator table │ Id index │ Type idx │
//! ├─────────────────────────────────────┤
//! │   Object heap (bitmap allocator)    │
//! ├─────────────────────────────────────┤
//! │       Persistence adapter (opt)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Constants and their compile-time checks
//! - [`error`]: Typed error taxonomy carried inside `eyre` reports
//! - [`memory`]: Bitmap and the object heap
//! - [`storage`]: Locators, version chains, object layout, record lists
//! - [`mvcc`]: Transaction manager and epoch reclamation
//! - [`catalog`]: Types, relationships and field layouts
//! - [`persistence`]: Adapter contract, record codec, memory and file logs
//! - [`triggers`]: Commit trigger events and listeners
//! - [`database`]: Builder, database handle and sessions

#[macro_use]
mod macros;

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod mvcc;
pub mod persistence;
pub mod storage;
pub mod triggers;

pub use catalog::{Cardinality, Catalog, Relationship, TypeMetadata};
pub use database::{Database, DatabaseBuilder, DatabaseStats, Session};
pub use error::DbError;
pub use persistence::{LogPersistence, MemoryPersistence, PersistenceAdapter};
pub use storage::{Locator, ObjectId, ObjectRecord, TypeId};
pub use triggers::{EventType, TriggerEvent, TriggerListener};
