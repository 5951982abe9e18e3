//! # locusdb Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SLOT_SIZE (64 bytes)
//!       │
//!       ├─> DEFAULT_HEAP_SIZE (must be a multiple)
//!       │     The heap bitmap tracks one bit per slot, so a heap that is not
//!       │     slot-aligned would leave a partial slot nobody can allocate.
//!       │
//!       ├─> OBJECT_HEADER_SIZE (24 bytes, fixed)
//!       │
//!       └─> MAX_OBJECT_SIZE (header + references + payload)
//!             Must fit in the smallest heap we allow, and the payload part
//!             must fit the u16 payload_size header field.
//!
//! MAX_CONCURRENT_TXNS (64)
//!       │
//!       └─> MAX_SESSIONS (must be <=)
//!             Every session may hold one transaction, and every transaction
//!             claims one slot. Capping sessions at the slot count means
//!             begin_transaction can never run out of slots.
//!
//! DEFAULT_MAX_LOCATORS (65536)
//!       │
//!       └─> Locator table capacity, fixed at open. One entry per locator.
//!
//! DEFAULT_RECORD_RANGE_SIZE (1024)
//!       │
//!       └─> Auto-compaction threshold: a record list compacts on scan start
//!           once more than one range worth of entries has been deleted.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `DEFAULT_HEAP_SIZE % SLOT_SIZE == 0`
//! 2. `MAX_OBJECT_SIZE <= MIN_HEAP_SIZE`
//! 3. `MAX_SESSIONS <= MAX_CONCURRENT_TXNS`
//! 4. `MAX_PAYLOAD_SIZE <= u16::MAX`
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{SLOT_SIZE, MAX_OBJECT_SIZE};
//! ```

// ============================================================================
// HEAP LAYOUT CONSTANTS
// ============================================================================

/// Allocation unit of the object heap. Every object occupies a whole number of
/// slots and every heap offset is slot-aligned.
pub const SLOT_SIZE: usize = 64;

/// Default size of the object heap (64 MiB of anonymous shared memory).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Smallest heap the builder accepts.
pub const MIN_HEAP_SIZE: usize = 256 * 1024;

/// Slot 0 is never handed out so that offset 0 keeps meaning "no object".
pub const RESERVED_SLOTS: usize = 1;

const _: () = assert!(
    DEFAULT_HEAP_SIZE % SLOT_SIZE == 0,
    "DEFAULT_HEAP_SIZE must be a multiple of SLOT_SIZE"
);

const _: () = assert!(
    MIN_HEAP_SIZE % SLOT_SIZE == 0,
    "MIN_HEAP_SIZE must be a multiple of SLOT_SIZE"
);

// ============================================================================
// OBJECT LAYOUT CONSTANTS
// ============================================================================

/// Size of the fixed object header:
/// locator (8) + id (8) + type_id (4) + reference_count (2) + payload_size (2).
pub const OBJECT_HEADER_SIZE: usize = 24;

/// Size of one reference slot (an object id).
pub const REFERENCE_SIZE: usize = 8;

/// Largest payload representable by the u16 payload_size header field.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest total encoded object (header + references + payload).
pub const MAX_OBJECT_SIZE: usize = 64 * 1024;

const _: () = assert!(
    MAX_PAYLOAD_SIZE <= u16::MAX as usize,
    "payload_size is stored in a u16 header field"
);

const _: () = assert!(
    MAX_OBJECT_SIZE <= MIN_HEAP_SIZE,
    "the largest object must fit into the smallest heap"
);

// ============================================================================
// LOCATOR AND RECORD LIST CONSTANTS
// ============================================================================

/// Default capacity of the locator table.
pub const DEFAULT_MAX_LOCATORS: usize = 1 << 16;

/// Default number of entries per record list range.
pub const DEFAULT_RECORD_RANGE_SIZE: usize = 1024;

// ============================================================================
// TRANSACTION CONSTANTS
// ============================================================================

/// Number of transaction slots in the transaction manager.
pub const MAX_CONCURRENT_TXNS: usize = 64;

/// Maximum number of open sessions per database.
pub const MAX_SESSIONS: usize = MAX_CONCURRENT_TXNS;

/// Default maximum number of distinct objects a single transaction may modify.
pub const DEFAULT_MAX_TXN_OBJECTS: usize = 1 << 16;

const _: () = assert!(
    MAX_SESSIONS <= MAX_CONCURRENT_TXNS,
    "MAX_SESSIONS must be <= MAX_CONCURRENT_TXNS or begin_transaction can run out of slots"
);

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Environment variable selecting the instance name.
pub const ENV_INSTANCE_NAME: &str = "LOCUSDB_INSTANCE_NAME";

/// Environment variable selecting the data directory for the file log.
pub const ENV_DATA_DIR: &str = "LOCUSDB_DATA_DIR";

/// Instance name used when none is configured.
pub const DEFAULT_INSTANCE_NAME: &str = "locusdb";
