//! # Catalog
//!
//! The catalog describes the types the database accepts: how many reference
//! slots an object of the type carries, which relationships those slots take
//! part in, and how the payload is divided into fields for change tracking.
//!
//! ## Relationships
//!
//! A relationship links a parent type to a child type through three
//! reference slots, forming an intrusive singly linked list of children:
//!
//! ```text
//!   parent (type 1)                 child (type 2)           child (type 2)
//!   refs[first_child_offset] ──>    refs[next_child_offset] ──> refs[next] = 0
//!                                   refs[parent_offset] ─┐      refs[parent] ─┐
//!        ^───────────────────────────────────────────────┴────────────────────┘
//! ```
//!
//! The same relationship is indexed twice: on the parent type by
//! `first_child_offset`, on the child type by `parent_offset`.
//!
//! ## Field Layouts
//!
//! A type may declare fixed byte ranges of its payload as numbered fields.
//! Updates diff the old and new payload over those ranges to report which
//! fields changed to trigger listeners. Types without a layout report no
//! field positions.

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::DbError;
use crate::storage::TypeId;

pub type FieldPosition = u16;
pub type ReferenceOffset = u16;

pub type FieldPositions = SmallVec<[FieldPosition; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub parent_type: TypeId,
    pub child_type: TypeId,
    pub first_child_offset: ReferenceOffset,
    pub next_child_offset: ReferenceOffset,
    pub parent_offset: ReferenceOffset,
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    pub position: FieldPosition,
    pub offset: u32,
    pub len: u32,
}

impl FieldLayout {
    fn slice<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        let start = (self.offset as usize).min(payload.len());
        let end = (self.offset as usize + self.len as usize).min(payload.len());
        &payload[start..end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMetadata {
    pub type_id: TypeId,
    pub reference_count: u16,
    pub fields: Vec<FieldLayout>,
    parent_relationships: HashMap<ReferenceOffset, Relationship>,
    child_relationships: HashMap<ReferenceOffset, Relationship>,
}

impl TypeMetadata {
    pub fn new(type_id: TypeId, reference_count: u16) -> Self {
        Self {
            type_id,
            reference_count,
            fields: Vec::new(),
            parent_relationships: HashMap::new(),
            child_relationships: HashMap::new(),
        }
    }

    pub fn with_field(mut self, position: FieldPosition, offset: u32, len: u32) -> Self {
        self.fields.push(FieldLayout {
            position,
            offset,
            len,
        });
        self
    }

    /// Relationship in which this type is the parent, keyed by the slot that
    /// holds the first child.
    pub fn find_parent_relationship(&self, offset: ReferenceOffset) -> Option<Relationship> {
        self.parent_relationships.get(&offset).copied()
    }

    /// Relationship in which this type is the child, keyed by the slot that
    /// holds the parent.
    pub fn find_child_relationship(&self, offset: ReferenceOffset) -> Option<Relationship> {
        self.child_relationships.get(&offset).copied()
    }

    pub fn changed_fields(&self, old: &[u8], new: &[u8]) -> FieldPositions {
        self.fields
            .iter()
            .filter(|field| field.slice(old) != field.slice(new))
            .map(|field| field.position)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    types: RwLock<HashMap<TypeId, TypeMetadata>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a type. Relationships already attached to an
    /// existing registration are kept.
    pub fn register_type(&self, metadata: TypeMetadata) {
        let mut types = self.types.write();
        match types.get_mut(&metadata.type_id) {
            Some(existing) => {
                existing.reference_count = metadata.reference_count;
                existing.fields = metadata.fields;
            }
            None => {
                types.insert(metadata.type_id, metadata);
            }
        }
    }

    pub fn add_relationship(&self, relationship: Relationship) -> Result<()> {
        let mut types = self.types.write();

        let parent = types
            .get(&relationship.parent_type)
            .ok_or(DbError::InvalidType(relationship.parent_type))?;
        ensure!(
            relationship.first_child_offset < parent.reference_count,
            "first_child_offset {} is outside the {} reference slots of type {}",
            relationship.first_child_offset,
            parent.reference_count,
            relationship.parent_type
        );

        let child = types
            .get(&relationship.child_type)
            .ok_or(DbError::InvalidType(relationship.child_type))?;
        ensure!(
            relationship.parent_offset < child.reference_count
                && relationship.next_child_offset < child.reference_count,
            "parent_offset {} / next_child_offset {} are outside the {} reference slots of type {}",
            relationship.parent_offset,
            relationship.next_child_offset,
            child.reference_count,
            relationship.child_type
        );
        ensure!(
            relationship.parent_offset != relationship.next_child_offset,
            "parent_offset and next_child_offset must be different slots"
        );
        ensure!(
            relationship.parent_type != relationship.child_type
                || (relationship.first_child_offset != relationship.parent_offset
                    && relationship.first_child_offset != relationship.next_child_offset),
            "first_child_offset {} of self-referential type {} overlaps a child slot",
            relationship.first_child_offset,
            relationship.parent_type
        );

        if let Some(parent) = types.get_mut(&relationship.parent_type) {
            parent
                .parent_relationships
                .insert(relationship.first_child_offset, relationship);
        }
        if let Some(child) = types.get_mut(&relationship.child_type) {
            child
                .child_relationships
                .insert(relationship.parent_offset, relationship);
        }
        Ok(())
    }

    pub fn get(&self, type_id: TypeId) -> Result<TypeMetadata> {
        self.types
            .read()
            .get(&type_id)
            .cloned()
            .ok_or_else(|| DbError::InvalidType(type_id).into())
    }

    pub fn contains(&self, type_id: TypeId) -> bool {
        self.types.read().contains_key(&type_id)
    }

    pub fn reference_count(&self, type_id: TypeId) -> Result<u16> {
        self.types
            .read()
            .get(&type_id)
            .map(|t| t.reference_count)
            .ok_or_else(|| DbError::InvalidType(type_id).into())
    }

    pub fn changed_fields(&self, type_id: TypeId, old: &[u8], new: &[u8]) -> FieldPositions {
        self.types
            .read()
            .get(&type_id)
            .map(|t| t.changed_fields(old, new))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::db_error;

    fn one_to_many() -> Relationship {
        Relationship {
            parent_type: 1,
            child_type: 2,
            first_child_offset: 0,
            next_child_offset: 0,
            parent_offset: 1,
            cardinality: Cardinality::Many,
        }
    }

    fn catalog_with_relationship() -> Catalog {
        let catalog = Catalog::new();
        catalog.register_type(TypeMetadata::new(1, 1));
        catalog.register_type(TypeMetadata::new(2, 2));
        catalog.add_relationship(one_to_many()).unwrap();
        catalog
    }

    #[test]
    fn relationship_is_indexed_on_both_sides() {
        let catalog = catalog_with_relationship();

        let parent = catalog.get(1).unwrap();
        assert_eq!(parent.find_parent_relationship(0), Some(one_to_many()));
        assert_eq!(parent.find_child_relationship(0), None);

        let child = catalog.get(2).unwrap();
        assert_eq!(child.find_child_relationship(1), Some(one_to_many()));
        assert_eq!(child.find_parent_relationship(1), None);
    }

    #[test]
    fn unknown_type_is_invalid_type() {
        let catalog = Catalog::new();
        let err = catalog.get(9).unwrap_err();
        assert_eq!(db_error(&err), Some(&DbError::InvalidType(9)));
        assert!(!catalog.contains(9));
    }

    #[test]
    fn relationship_offsets_must_fit_reference_slots() {
        let catalog = Catalog::new();
        catalog.register_type(TypeMetadata::new(1, 1));
        catalog.register_type(TypeMetadata::new(2, 1));

        assert!(catalog.add_relationship(one_to_many()).is_err());
    }

    #[test]
    fn reregistering_type_keeps_relationships() {
        let catalog = catalog_with_relationship();
        catalog.register_type(TypeMetadata::new(1, 1).with_field(0, 0, 4));

        let parent = catalog.get(1).unwrap();
        assert!(parent.find_parent_relationship(0).is_some());
        assert_eq!(parent.fields.len(), 1);
    }

    #[test]
    fn changed_fields_compares_declared_ranges() {
        let metadata = TypeMetadata::new(3, 0)
            .with_field(0, 0, 2)
            .with_field(1, 2, 2)
            .with_field(2, 4, 4);

        let changed = metadata.changed_fields(b"aabbcccc", b"aaBBcccc");
        assert_eq!(changed.as_slice(), &[1]);

        let changed = metadata.changed_fields(b"aabb", b"aabbcc");
        assert_eq!(changed.as_slice(), &[2]);
    }

    #[test]
    fn type_without_layout_reports_no_fields() {
        let catalog = Catalog::new();
        catalog.register_type(TypeMetadata::new(4, 0));
        assert!(catalog.changed_fields(4, b"a", b"b").is_empty());
    }
}
