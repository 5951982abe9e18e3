//! # Durable Record Encoding
//!
//! Objects are logged as key/value pairs. The key is the object id as 8
//! big-endian bytes so that byte order equals id order in any sorted store.
//! The value carries everything but the id and the locator (which is a
//! process-local handle):
//!
//! ```text
//! +-----------+-----------+--------------+---------------------+---------+
//! | type_id   | ref_count | payload_size | references          | payload |
//! | u32 BE    | u16 BE    | u16 BE       | ref_count * u64 BE  | bytes   |
//! +-----------+-----------+--------------+---------------------+---------+
//! ```
//!
//! The payload comes last so an empty payload needs no special case.

use eyre::Result;
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::DbError;
use crate::storage::{ObjectId, ObjectRecord, INVALID_LOCATOR};

pub const KEY_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ValueHeader {
    type_id: U32,
    reference_count: U16,
    payload_size: U16,
}

const VALUE_HEADER_SIZE: usize = std::mem::size_of::<ValueHeader>();

const _: () = assert!(VALUE_HEADER_SIZE == 8);

pub fn encode_key(id: ObjectId) -> [u8; KEY_SIZE] {
    U64::new(id).to_bytes()
}

pub fn decode_key(key: &[u8]) -> Result<ObjectId> {
    let raw = U64::read_from_bytes(key).map_err(|_| {
        DbError::Corrupted(format!(
            "object key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        ))
    })?;
    Ok(raw.get())
}

pub fn encode_object(record: &ObjectRecord) -> Vec<u8> {
    let header = ValueHeader {
        type_id: U32::new(record.type_id),
        reference_count: U16::new(record.references.len() as u16),
        payload_size: U16::new(record.payload.len() as u16),
    };
    let references: Vec<U64> = record.references.iter().map(|&id| U64::new(id)).collect();

    let mut value =
        Vec::with_capacity(VALUE_HEADER_SIZE + references.as_bytes().len() + record.payload.len());
    value.extend_from_slice(header.as_bytes());
    value.extend_from_slice(references.as_bytes());
    value.extend_from_slice(&record.payload);
    value
}

fn corrupted(id: ObjectId, what: impl std::fmt::Display) -> eyre::Report {
    DbError::Corrupted(format!("object {id}: {what}")).into()
}

/// Decodes a logged record. The returned record has no locator yet.
pub fn decode_object(key: &[u8], value: &[u8]) -> Result<ObjectRecord> {
    let id = decode_key(key)?;
    let Ok((header, body)) = ValueHeader::ref_from_prefix(value) else {
        return Err(corrupted(
            id,
            format!("value of {} bytes is shorter than its header", value.len()),
        ));
    };

    let refs_len = header.reference_count.get() as usize * std::mem::size_of::<U64>();
    let expected = VALUE_HEADER_SIZE + refs_len + header.payload_size.get() as usize;
    if value.len() != expected {
        return Err(corrupted(
            id,
            format!("value is {} bytes, header describes {}", value.len(), expected),
        ));
    }

    let (refs, payload) = body.split_at(refs_len);
    let references = <[U64]>::ref_from_bytes(refs)
        .map_err(|_| corrupted(id, "reference array does not divide into ids"))?
        .iter()
        .map(|reference| reference.get())
        .collect();

    Ok(ObjectRecord {
        locator: INVALID_LOCATOR,
        id,
        type_id: header.type_id.get(),
        references,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::db_error;
    use smallvec::smallvec;

    fn sample() -> ObjectRecord {
        ObjectRecord {
            locator: INVALID_LOCATOR,
            id: 0x0102_0304,
            type_id: 7,
            references: smallvec![11, 0],
            payload: b"hello".to_vec(),
        }
    }

    #[test]
    fn key_is_big_endian_so_byte_order_matches_id_order() {
        assert_eq!(encode_key(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(encode_key(255) < encode_key(256));
    }

    #[test]
    fn value_layout_is_big_endian() {
        let value = encode_object(&sample());
        assert_eq!(&value[..4], &[0, 0, 0, 7]);
        assert_eq!(&value[4..6], &[0, 2]);
        assert_eq!(&value[6..8], &[0, 5]);
        assert_eq!(&value[8..16], &11u64.to_be_bytes());
        assert_eq!(&value[24..], b"hello");
    }

    #[test]
    fn decode_restores_encoded_object() {
        let record = sample();
        let decoded = decode_object(&encode_key(record.id), &encode_object(&record)).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_payload_decodes() {
        let record = ObjectRecord {
            payload: Vec::new(),
            references: smallvec![],
            ..sample()
        };
        let value = encode_object(&record);
        assert_eq!(value.len(), 8);
        assert!(decode_object(&encode_key(record.id), &value)
            .unwrap()
            .payload
            .is_empty());
    }

    #[test]
    fn length_mismatch_is_corrupted() {
        let mut value = encode_object(&sample());
        value.push(0);
        let err = decode_object(&encode_key(1), &value).unwrap_err();
        assert!(matches!(db_error(&err), Some(DbError::Corrupted(_))));

        let err = decode_object(&encode_key(1), &value[..3]).unwrap_err();
        assert!(matches!(db_error(&err), Some(DbError::Corrupted(_))));
    }

    #[test]
    fn short_key_is_corrupted() {
        let err = decode_object(&[1, 2, 3], &encode_object(&sample())).unwrap_err();
        assert!(matches!(db_error(&err), Some(DbError::Corrupted(_))));
    }
}
