//! # Relationship Maintenance
//!
//! Parent/child links live in the objects' reference slots, as described in
//! [`crate::catalog`]. Connecting a child pushes it onto the front of the
//! parent's child list:
//!
//! ```text
//! before:  P.first ──> C1 ──> 0
//! connect C2
//! after:   P.first ──> C2 ──> C1 ──> 0        C2.parent = P
//! ```
//!
//! Disconnecting unlinks the child wherever it sits in the list and clears
//! its parent and next slots. Each touched object gets a new private version,
//! so a relationship change is an ordinary copy-on-write update that counts
//! against the transaction's object limit and conflicts like any other write.
//!
//! The parent-side operations (`*_child_reference`) take the parent's
//! `first_child_offset`; the child-side ones (`*_parent_reference`) take the
//! child's `parent_offset` and forward to them.

use eyre::Result;

use super::database::SharedDatabase;
use super::session::Session;
use super::transaction::ActiveTransaction;
use crate::catalog::{Cardinality, ReferenceOffset, Relationship};
use crate::error::DbError;
use crate::storage::{ObjectId, ObjectRecord, INVALID_OBJECT_ID};

fn slot(record: &ObjectRecord, offset: ReferenceOffset) -> Result<ObjectId> {
    record
        .references
        .get(offset as usize)
        .copied()
        .ok_or_else(|| {
            DbError::InvalidReferenceOffset {
                type_id: record.type_id,
                offset,
            }
            .into()
        })
}

fn set_slot(record: &mut ObjectRecord, offset: ReferenceOffset, value: ObjectId) -> Result<()> {
    let type_id = record.type_id;
    let reference = record
        .references
        .get_mut(offset as usize)
        .ok_or(DbError::InvalidReferenceOffset { type_id, offset })?;
    *reference = value;
    Ok(())
}

impl ActiveTransaction {
    fn parent_relationship(
        &self,
        db: &SharedDatabase,
        parent: &ObjectRecord,
        first_child_offset: ReferenceOffset,
    ) -> Result<Relationship> {
        db.catalog
            .get(parent.type_id)?
            .find_parent_relationship(first_child_offset)
            .ok_or_else(|| {
                DbError::InvalidReferenceOffset {
                    type_id: parent.type_id,
                    offset: first_child_offset,
                }
                .into()
            })
    }

    fn child_relationship(
        &self,
        db: &SharedDatabase,
        child: &ObjectRecord,
        parent_offset: ReferenceOffset,
    ) -> Result<Relationship> {
        db.catalog
            .get(child.type_id)?
            .find_child_relationship(parent_offset)
            .ok_or_else(|| {
                DbError::InvalidReferenceOffset {
                    type_id: child.type_id,
                    offset: parent_offset,
                }
                .into()
            })
    }

    pub(crate) fn add_child_reference(
        &mut self,
        db: &SharedDatabase,
        parent_id: ObjectId,
        child_id: ObjectId,
        first_child_offset: ReferenceOffset,
    ) -> Result<()> {
        let mut parent = self.get(db, parent_id)?;
        let mut child = self.get(db, child_id)?;
        let relationship = self.parent_relationship(db, &parent, first_child_offset)?;

        if child.type_id != relationship.child_type {
            return Err(DbError::InvalidChildReference(format!(
                "object {child_id} has type {}, relationship at offset {first_child_offset} of type {} expects type {}",
                child.type_id, parent.type_id, relationship.child_type
            ))
            .into());
        }

        let current_parent = slot(&child, relationship.parent_offset)?;
        if current_parent == parent_id {
            return Ok(());
        }
        if current_parent != INVALID_OBJECT_ID {
            return Err(DbError::ChildAlreadyReferenced {
                child_id,
                type_id: child.type_id,
                offset: relationship.parent_offset,
            }
            .into());
        }

        let first_child = slot(&parent, first_child_offset)?;
        if relationship.cardinality == Cardinality::One && first_child != INVALID_OBJECT_ID {
            return Err(DbError::SingleCardinalityViolation {
                type_id: parent.type_id,
                offset: first_child_offset,
            }
            .into());
        }

        self.reserve(db, &[child.locator, parent.locator])?;
        set_slot(&mut child, relationship.next_child_offset, first_child)?;
        set_slot(&mut child, relationship.parent_offset, parent_id)?;
        if child.locator == parent.locator {
            // An object that is its own child: all three slots live in one version.
            set_slot(&mut child, first_child_offset, child_id)?;
            return self.update_references(db, &child);
        }
        set_slot(&mut parent, first_child_offset, child_id)?;

        self.update_references(db, &child)?;
        self.update_references(db, &parent)
    }

    pub(crate) fn remove_child_reference(
        &mut self,
        db: &SharedDatabase,
        parent_id: ObjectId,
        child_id: ObjectId,
        first_child_offset: ReferenceOffset,
    ) -> Result<()> {
        let parent = self.get(db, parent_id)?;
        let mut child = self.get(db, child_id)?;
        let relationship = self.parent_relationship(db, &parent, first_child_offset)?;

        if child.type_id != relationship.child_type
            || slot(&child, relationship.parent_offset)? != parent_id
        {
            return Err(DbError::InvalidChildReference(format!(
                "object {child_id} is not a child of object {parent_id} at offset {first_child_offset}"
            ))
            .into());
        }

        let next = slot(&child, relationship.next_child_offset)?;
        let first_child = slot(&parent, first_child_offset)?;

        let (mut predecessor, predecessor_offset) = if first_child == child_id {
            (parent, first_child_offset)
        } else {
            let previous = self.find_previous_sibling(
                db,
                first_child,
                child_id,
                relationship.next_child_offset,
            )?;
            (previous, relationship.next_child_offset)
        };
        self.reserve(db, &[predecessor.locator, child.locator])?;

        set_slot(&mut predecessor, predecessor_offset, next)?;
        if predecessor.locator == child.locator {
            child = predecessor;
        } else {
            self.update_references(db, &predecessor)?;
        }

        set_slot(&mut child, relationship.next_child_offset, INVALID_OBJECT_ID)?;
        set_slot(&mut child, relationship.parent_offset, INVALID_OBJECT_ID)?;
        self.update_references(db, &child)
    }

    fn find_previous_sibling(
        &self,
        db: &SharedDatabase,
        first_child: ObjectId,
        child_id: ObjectId,
        next_child_offset: ReferenceOffset,
    ) -> Result<ObjectRecord> {
        let mut current_id = first_child;
        while current_id != INVALID_OBJECT_ID {
            let current = self.get(db, current_id)?;
            let next = slot(&current, next_child_offset)?;
            if next == child_id {
                return Ok(current);
            }
            current_id = next;
        }
        Err(DbError::InvalidChildReference(format!(
            "object {child_id} is not linked from its parent's child list"
        ))
        .into())
    }

    pub(crate) fn add_parent_reference(
        &mut self,
        db: &SharedDatabase,
        child_id: ObjectId,
        parent_id: ObjectId,
        parent_offset: ReferenceOffset,
    ) -> Result<()> {
        let child = self.get(db, child_id)?;
        let parent = self.get(db, parent_id)?;
        let relationship = self.child_relationship(db, &child, parent_offset)?;

        if parent.type_id != relationship.parent_type {
            return Err(DbError::InvalidChildReference(format!(
                "object {parent_id} has type {}, relationship at offset {parent_offset} of type {} expects parent type {}",
                parent.type_id, child.type_id, relationship.parent_type
            ))
            .into());
        }
        self.add_child_reference(db, parent_id, child_id, relationship.first_child_offset)
    }

    pub(crate) fn remove_parent_reference(
        &mut self,
        db: &SharedDatabase,
        child_id: ObjectId,
        parent_offset: ReferenceOffset,
    ) -> Result<()> {
        let child = self.get(db, child_id)?;
        let relationship = self.child_relationship(db, &child, parent_offset)?;

        let parent_id = slot(&child, parent_offset)?;
        if parent_id == INVALID_OBJECT_ID {
            return Err(DbError::InvalidChildReference(format!(
                "object {child_id} has no parent at offset {parent_offset}"
            ))
            .into());
        }
        self.remove_child_reference(db, parent_id, child_id, relationship.first_child_offset)
    }
}

impl Session {
    /// Links `child_id` as the first child of `parent_id` through the
    /// relationship the parent's type declares at `first_child_offset`.
    pub fn add_child_reference(
        &mut self,
        parent_id: ObjectId,
        child_id: ObjectId,
        first_child_offset: ReferenceOffset,
    ) -> Result<()> {
        self.with_txn(|db, txn| txn.add_child_reference(db, parent_id, child_id, first_child_offset))
    }

    pub fn remove_child_reference(
        &mut self,
        parent_id: ObjectId,
        child_id: ObjectId,
        first_child_offset: ReferenceOffset,
    ) -> Result<()> {
        self.with_txn(|db, txn| {
            txn.remove_child_reference(db, parent_id, child_id, first_child_offset)
        })
    }

    /// Child-side variant of [`add_child_reference`](Self::add_child_reference).
    pub fn add_parent_reference(
        &mut self,
        child_id: ObjectId,
        parent_id: ObjectId,
        parent_offset: ReferenceOffset,
    ) -> Result<()> {
        self.with_txn(|db, txn| txn.add_parent_reference(db, child_id, parent_id, parent_offset))
    }

    pub fn remove_parent_reference(
        &mut self,
        child_id: ObjectId,
        parent_offset: ReferenceOffset,
    ) -> Result<()> {
        self.with_txn(|db, txn| txn.remove_parent_reference(db, child_id, parent_offset))
    }
}
