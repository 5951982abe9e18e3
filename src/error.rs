//! # Error Taxonomy
//!
//! All fallible operations return `eyre::Result`. Failures that a client may
//! want to react to are raised as a typed [`DbError`] inside the report, so a
//! caller can branch on the kind while still getting the full context chain:
//!
//! ```ignore
//! match session.commit_transaction() {
//!     Err(e) if locusdb::error::is_update_conflict(&e) => retry(),
//!     other => other?,
//! }
//! ```
//!
//! ## Categories
//!
//! | Category    | Variants                                                        |
//! |-------------|-----------------------------------------------------------------|
//! | Session     | `SessionExists`, `SessionLimitExceeded`                         |
//! | Transaction | `TransactionInProgress`, `NoOpenTransaction`,                   |
//! |             | `TransactionUpdateConflict`, `ObjectLimitExceeded`              |
//! | Object      | `DuplicateObjectId`, `ObjectNotFound`, `InvalidObjectId`,       |
//! |             | `ObjectTooLarge`, `InvalidType`, `InvalidReferenceOffset`,      |
//! |             | `SingleCardinalityViolation`, `ChildAlreadyReferenced`,         |
//! |             | `InvalidChildReference`, `ObjectStillReferenced`                |
//! | Resource    | `OutOfMemory`, `SystemObjectLimitExceeded`                      |
//! | Persistence | `Persistence`, `Corrupted`                                      |
//!
//! Nothing is retried internally. `TransactionUpdateConflict` is the only kind
//! a client is expected to retry; resource and persistence failures abort the
//! enclosing transaction.

use thiserror::Error;

use crate::storage::{Locator, ObjectId, TypeId};

/// Typed failure kinds surfaced to sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("a session is already open on this thread")]
    SessionExists,

    #[error("session limit exceeded (max {max})")]
    SessionLimitExceeded { max: usize },

    #[error("transaction already in progress")]
    TransactionInProgress,

    #[error("no open transaction")]
    NoOpenTransaction,

    #[error("transaction {txn_id} aborted: locator {locator} was updated by a concurrent transaction")]
    TransactionUpdateConflict { txn_id: u64, locator: Locator },

    #[error("transaction exceeded the limit of {max} modified objects")]
    ObjectLimitExceeded { max: usize },

    #[error("object id {0} already exists")]
    DuplicateObjectId(ObjectId),

    #[error("object id {0} not found")]
    ObjectNotFound(ObjectId),

    #[error("object id {0} is not a valid id")]
    InvalidObjectId(ObjectId),

    #[error("object of {size} bytes exceeds the maximum object size of {max} bytes")]
    ObjectTooLarge { size: usize, max: usize },

    #[error("type {0} is not registered in the catalog")]
    InvalidType(TypeId),

    #[error("type {type_id} has no relationship at reference offset {offset}")]
    InvalidReferenceOffset { type_id: TypeId, offset: u16 },

    #[error("type {type_id} allows a single child at reference offset {offset}, which is already set")]
    SingleCardinalityViolation { type_id: TypeId, offset: u16 },

    #[error("object {child_id} of type {type_id} is already referenced by a parent at offset {offset}")]
    ChildAlreadyReferenced {
        child_id: ObjectId,
        type_id: TypeId,
        offset: u16,
    },

    #[error("invalid child reference: {0}")]
    InvalidChildReference(String),

    #[error("object {id} of type {type_id} cannot be deleted while it still holds references")]
    ObjectStillReferenced { id: ObjectId, type_id: TypeId },

    #[error("object heap exhausted: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("system object limit exceeded (max {max} locators)")]
    SystemObjectLimitExceeded { max: usize },

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("corrupted record: {0}")]
    Corrupted(String),
}

impl DbError {
    /// Whether a client may reasonably retry the whole transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::TransactionUpdateConflict { .. })
    }

    /// Whether the failure aborts the enclosing transaction.
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            DbError::TransactionUpdateConflict { .. }
                | DbError::OutOfMemory { .. }
                | DbError::Persistence(_)
        )
    }
}

/// Returns the typed error carried by a report, if any.
pub fn db_error(report: &eyre::Report) -> Option<&DbError> {
    report.downcast_ref::<DbError>()
}

pub fn is_update_conflict(report: &eyre::Report) -> bool {
    db_error(report).is_some_and(DbError::is_retryable)
}
