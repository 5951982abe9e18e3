//! # In-Heap Object Layout
//!
//! Every object version occupies a contiguous slot run in the heap:
//!
//! ```text
//! +---------+---------+-----------+-----------+--------------+---------------+---------+
//! | locator | id      | type_id   | ref_count | payload_size | references    | payload |
//! | u64 LE  | u64 LE  | u32 LE    | u16 LE    | u16 LE       | ref_count*u64 | bytes   |
//! +---------+---------+-----------+-----------+--------------+---------------+---------+
//! |<------------------- 24-byte header ------------------->|
//! ```
//!
//! The header uses zerocopy little-endian wrappers so it can be read straight
//! out of an unaligned heap buffer. The locator back-reference lets integrity
//! checks confirm that a table entry and the object it points at agree.
//!
//! Reference slots hold object ids (0 for "no reference") in the order the
//! catalog assigns to the type's relationships.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Locator, ObjectId, TypeId};
use crate::config::{MAX_OBJECT_SIZE, MAX_PAYLOAD_SIZE, OBJECT_HEADER_SIZE, REFERENCE_SIZE};
use crate::error::DbError;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ObjectHeader {
    locator: U64,
    id: U64,
    type_id: U32,
    reference_count: U16,
    payload_size: U16,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == OBJECT_HEADER_SIZE);

impl ObjectHeader {
    le_accessors! {
        locator: u64,
        id: u64,
        type_id: u32,
        reference_count: u16,
        payload_size: u16,
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= OBJECT_HEADER_SIZE,
            "buffer too small for ObjectHeader: {} < {}",
            bytes.len(),
            OBJECT_HEADER_SIZE
        );
        Self::ref_from_bytes(&bytes[..OBJECT_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ObjectHeader: {:?}", e))
    }

    pub fn body_len(&self) -> usize {
        self.reference_count() as usize * REFERENCE_SIZE + self.payload_size() as usize
    }
}

/// Owned copy of one object version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub locator: Locator,
    pub id: ObjectId,
    pub type_id: TypeId,
    pub references: SmallVec<[ObjectId; 4]>,
    pub payload: Vec<u8>,
}

impl ObjectRecord {
    pub fn encoded_len(reference_count: usize, payload_len: usize) -> usize {
        OBJECT_HEADER_SIZE + reference_count * REFERENCE_SIZE + payload_len
    }

    /// Fails with `ObjectTooLarge` when the object cannot be stored.
    pub fn check_size(reference_count: usize, payload_len: usize) -> Result<usize> {
        let size = Self::encoded_len(reference_count, payload_len);
        if payload_len > MAX_PAYLOAD_SIZE || reference_count > u16::MAX as usize {
            return Err(DbError::ObjectTooLarge {
                size,
                max: MAX_OBJECT_SIZE,
            }
            .into());
        }
        if size > MAX_OBJECT_SIZE {
            return Err(DbError::ObjectTooLarge {
                size,
                max: MAX_OBJECT_SIZE,
            }
            .into());
        }
        Ok(size)
    }

    pub fn encoded_size(&self) -> usize {
        Self::encoded_len(self.references.len(), self.payload.len())
    }

    pub fn reference(&self, slot: usize) -> Option<ObjectId> {
        self.references.get(slot).copied().filter(|&id| id != 0)
    }

    pub fn to_heap_bytes(&self) -> Vec<u8> {
        let mut header = ObjectHeader::new_zeroed();
        header.set_locator(self.locator);
        header.set_id(self.id);
        header.set_type_id(self.type_id);
        header.set_reference_count(self.references.len() as u16);
        header.set_payload_size(self.payload.len() as u16);

        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(header.as_bytes());
        for reference in &self.references {
            bytes.extend_from_slice(&reference.to_le_bytes());
        }
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_heap_bytes(bytes: &[u8]) -> Result<Self> {
        let header = ObjectHeader::from_bytes(bytes)?;
        let end = OBJECT_HEADER_SIZE + header.body_len();
        if bytes.len() < end {
            return Err(DbError::Corrupted(format!(
                "object {} claims {} bytes but only {} are available",
                header.id(),
                end,
                bytes.len()
            ))
            .into());
        }

        let refs_end = OBJECT_HEADER_SIZE + header.reference_count() as usize * REFERENCE_SIZE;
        let references = bytes[OBJECT_HEADER_SIZE..refs_end]
            .chunks_exact(REFERENCE_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; REFERENCE_SIZE];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect();

        Ok(Self {
            locator: header.locator(),
            id: header.id(),
            type_id: header.type_id(),
            references,
            payload: bytes[refs_end..end].to_vec(),
        })
    }
}
