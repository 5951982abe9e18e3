//! # Storage Module
//!
//! This module provides the addressing layer between client-visible object ids
//! and the bytes in the [`crate::memory::ObjectHeap`].
//!
//! ## Architecture Overview
//!
//! Every object is reached through two indirections:
//!
//! ```text
//!   ObjectId ──IdIndex──> Locator ──LocatorTable──> [(commit_ts, offset), ...]
//!                                                          │
//!                                                          v
//!                                              ObjectHeap slot run
//!                                 +--------+--------------+---------+
//!                                 | header | refs (u64..) | payload |
//!                                 +--------+--------------+---------+
//! ```
//!
//! - **ObjectId**: chosen by the client, stable for the life of the object.
//! - **Locator**: dense internal handle handed out by [`LocatorAllocator`].
//!   Locators are recycled only after the object is deleted and reclaimed.
//! - **LocatorTable**: a fixed array indexed by locator. Each entry holds a
//!   short chain of versions ordered by commit timestamp. A snapshot sees the
//!   newest version whose timestamp is at or below its own.
//!
//! ## Type Index
//!
//! [`TypeIndex`] keeps one [`RecordList`] per type id so that "all objects of
//! type T" is a walk over a chain of fixed-size ranges instead of a scan of the
//! whole locator table. Record lists only say which locators *may* hold an
//! object of the type; visibility is always decided by the locator table.
//!
//! ## Object Layout
//!
//! See [`object`] for the in-heap header. The header embeds the locator so that
//! `Database::verify` can check that every published offset points back at
//! the entry that references it.

pub mod locator;
pub mod object;
pub mod record_list;
pub mod type_index;

pub use locator::{IdIndex, LocatorAllocator, LocatorTable, LocatorVersion, Pruned};
pub use object::{ObjectHeader, ObjectRecord};
pub use record_list::{RecordData, RecordIterator, RecordList};
pub use type_index::TypeIndex;

/// Internal handle of an object slot in the locator table.
pub type Locator = u64;

/// Client-chosen object identifier.
pub type ObjectId = u64;

/// Catalog type identifier.
pub type TypeId = u32;

pub const INVALID_LOCATOR: Locator = 0;
pub const INVALID_OBJECT_ID: ObjectId = 0;
