//! Fuzz testing for the persisted object codec.
//!
//! Feeds arbitrary key/value pairs to `decode_object` to ensure malformed
//! store contents are rejected with an error instead of a panic, and that
//! everything the decoder accepts encodes back to the same bytes.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use locusdb::persistence::{decode_object, encode_key, encode_object};

#[derive(Debug, Arbitrary)]
struct CodecInput {
    key: Vec<u8>,
    value: Vec<u8>,
}

fuzz_target!(|input: CodecInput| {
    let Ok(record) = decode_object(&input.key, &input.value) else {
        return;
    };

    assert_eq!(encode_key(record.id).as_slice(), input.key.as_slice());
    assert_eq!(encode_object(&record), input.value);
});
