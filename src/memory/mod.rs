//! # Shared Memory
//!
//! This module owns the raw memory every object version lives in and the
//! free-space tracking for it.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                 ObjectHeap (anonymous mmap)                 |
//! |  slot 0 (reserved) | slot 1 | slot 2 | ... | slot N-1        |
//! +-------------------------------------------------------------+
//!            ^ one bit per slot
//! +-------------------------------------------------------------+
//! |                 Bitmap (AtomicU64 words)                    |
//! +-------------------------------------------------------------+
//! ```
//!
//! The heap never moves or grows. Object versions are copy-on-write: an
//! update allocates a fresh run of slots, and the superseded run is handed to
//! the epoch reclaimer in [`crate::mvcc::gc`], which frees it once no snapshot
//! can reach it.
//!
//! ## Failure Model
//!
//! Running out of slots surfaces as [`crate::error::DbError::OutOfMemory`].
//! The session layer treats it as fatal to the transaction and rolls back.

pub mod bitmap;
mod heap;

pub use bitmap::{Bitmap, NOT_FOUND};
pub use heap::{slots_for, HeapOffset, HeapStats, ObjectHeap};
