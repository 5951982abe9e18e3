//! Fuzz testing for the transaction engine.
//!
//! Runs arbitrary sequences of object operations, commits and rollbacks on a
//! small database and checks after every step that the committed state is
//! still consistent. Errors from individual operations are expected; panics
//! and failed verification are not.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use locusdb::config::MIN_HEAP_SIZE;
use locusdb::{Cardinality, Database, Relationship, TypeMetadata};

const PARENT: u32 = 1;
const CHILD: u32 = 2;

#[derive(Debug, Arbitrary)]
enum Op {
    Begin,
    Commit,
    Rollback,
    Create { id: u8, child: bool, payload: Vec<u8> },
    Update { id: u8, payload: Vec<u8> },
    Delete { id: u8 },
    Get { id: u8 },
    Scan { child: bool },
    Link { parent: u8, child: u8 },
    Unlink { parent: u8, child: u8 },
    Collect,
}

fuzz_target!(|ops: Vec<Op>| {
    let Ok(db) = Database::builder()
        .heap_size(MIN_HEAP_SIZE)
        .max_locators(256)
        .max_txn_objects(64)
        .open()
    else {
        return;
    };
    db.register_type(TypeMetadata::new(PARENT, 1));
    db.register_type(TypeMetadata::new(CHILD, 2));
    db.add_relationship(Relationship {
        parent_type: PARENT,
        child_type: CHILD,
        first_child_offset: 0,
        next_child_offset: 1,
        parent_offset: 0,
        cardinality: Cardinality::Many,
    })
    .unwrap();

    let mut session = db.begin_session().unwrap();
    for op in ops {
        let _ = match op {
            Op::Begin => session.begin_transaction(),
            Op::Commit => session.commit_transaction(),
            Op::Rollback => session.rollback_transaction(),
            Op::Create { id, child, payload } => {
                let type_id = if child { CHILD } else { PARENT };
                session.create_object(id.into(), type_id, &payload)
            }
            Op::Update { id, payload } => session.update_payload(id.into(), &payload),
            Op::Delete { id } => session.delete_object(id.into()),
            Op::Get { id } => session.get(id.into()).map(drop),
            Op::Scan { child } => session
                .scan_type(if child { CHILD } else { PARENT })
                .map(drop),
            Op::Link { parent, child } => {
                session.add_child_reference(parent.into(), child.into(), 0)
            }
            Op::Unlink { parent, child } => {
                session.remove_child_reference(parent.into(), child.into(), 0)
            }
            Op::Collect => {
                db.collect_garbage();
                Ok(())
            }
        };
        db.verify().unwrap();
    }

    session.end().unwrap();
    db.collect_garbage();
    db.verify().unwrap();
    assert_eq!(db.stats().active_transactions, 0);
});
