//! # Commit Trigger Tests
//!
//! Verifies what the trigger listener receives across the transaction
//! lifecycle:
//!
//! 1. **Commit batches**: row events in operation order, closed by one
//!    `TransactionCommit` marker
//! 2. **Changed fields**: updates report the declared fields whose bytes
//!    differ
//! 3. **Silence**: rollbacks, conflicts, read-only and reference-only
//!    transactions dispatch nothing
//! 4. **Visibility**: the listener runs after the commit is published
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test triggers
//! ```

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use locusdb::{Cardinality, Database, EventType, Relationship, TriggerEvent, TypeMetadata};

const ACCOUNT: u32 = 3;
const ENTRY: u32 = 4;

type Batches = Arc<Mutex<Vec<(u64, Vec<TriggerEvent>, bool)>>>;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn create_recording_db(immediate: bool) -> (Database, Batches) {
    let batches: Batches = Arc::default();
    let sink = Arc::clone(&batches);
    let db = Database::builder()
        .immediate_triggers(immediate)
        .trigger_listener(move |txn: u64, events: &[TriggerEvent], immediate: bool| {
            sink.lock().unwrap().push((txn, events.to_vec(), immediate));
        })
        .open()
        .unwrap();

    // Fields: [0..4) balance, [4..8) flags.
    db.register_type(
        TypeMetadata::new(ACCOUNT, 1)
            .with_field(0, 0, 4)
            .with_field(1, 4, 4),
    );
    db.register_type(TypeMetadata::new(ENTRY, 2));
    db.add_relationship(Relationship {
        parent_type: ACCOUNT,
        child_type: ENTRY,
        first_child_offset: 0,
        next_child_offset: 1,
        parent_offset: 0,
        cardinality: Cardinality::Many,
    })
    .unwrap();
    (db, batches)
}

fn event_kinds(events: &[TriggerEvent]) -> Vec<(EventType, u64)> {
    events.iter().map(|e| (e.event_type, e.object_id)).collect()
}

// ============================================================================
// COMMIT BATCHES
// ============================================================================

mod batch_tests {
    use super::*;

    #[test]
    fn events_arrive_in_operation_order() {
        let (db, batches) = create_recording_db(false);
        let mut session = db.begin_session().unwrap();

        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.create_object(2, ACCOUNT, &[0; 8]).unwrap();
        let txn_id = session.transaction_id().unwrap();
        session.commit_transaction().unwrap();

        session.begin_transaction().unwrap();
        session.update_payload(2, &[1, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        session.delete_object(1).unwrap();
        session.commit_transaction().unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);

        let (first_txn, first, immediate) = &batches[0];
        assert_eq!(*first_txn, txn_id);
        assert!(!immediate);
        assert_eq!(
            event_kinds(first),
            vec![
                (EventType::RowInsert, 1),
                (EventType::RowInsert, 2),
                (EventType::TransactionCommit, 0),
            ]
        );
        assert!(first.iter().take(2).all(|e| e.type_id == ACCOUNT));

        let (_, second, _) = &batches[1];
        assert_eq!(
            event_kinds(second),
            vec![
                (EventType::RowUpdate, 2),
                (EventType::RowDelete, 1),
                (EventType::TransactionCommit, 0),
            ]
        );
    }

    #[test]
    fn updates_report_changed_fields() {
        let (db, batches) = create_recording_db(false);
        let mut session = db.begin_session().unwrap();

        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.commit_transaction().unwrap();

        session.begin_transaction().unwrap();
        session.update_payload(1, &[0, 0, 0, 0, 9, 0, 0, 0]).unwrap();
        session.commit_transaction().unwrap();

        session.begin_transaction().unwrap();
        session.update_payload(1, &[5, 0, 0, 0, 7, 0, 0, 0]).unwrap();
        session.commit_transaction().unwrap();

        let batches = batches.lock().unwrap();
        assert_eq!(batches[1].1[0].changed_fields.as_slice(), &[1]);
        assert_eq!(batches[2].1[0].changed_fields.as_slice(), &[0, 1]);
    }

    #[test]
    fn immediate_flag_is_passed_through() {
        let (db, batches) = create_recording_db(true);
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.commit_transaction().unwrap();

        assert!(batches.lock().unwrap()[0].2);
    }
}

// ============================================================================
// SILENT TRANSACTIONS
// ============================================================================

mod silence_tests {
    use super::*;

    #[test]
    fn rollback_and_read_only_dispatch_nothing() {
        let (db, batches) = create_recording_db(false);
        let mut session = db.begin_session().unwrap();

        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.rollback_transaction().unwrap();

        session.begin_transaction().unwrap();
        assert!(session.try_get(1).unwrap().is_none());
        session.commit_transaction().unwrap();

        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn reference_only_changes_dispatch_nothing() {
        let (db, batches) = create_recording_db(false);
        let mut session = db.begin_session().unwrap();

        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.create_object(2, ENTRY, b"entry").unwrap();
        session.commit_transaction().unwrap();
        assert_eq!(batches.lock().unwrap().len(), 1);

        session.begin_transaction().unwrap();
        session.add_child_reference(1, 2, 0).unwrap();
        session.commit_transaction().unwrap();
        assert_eq!(batches.lock().unwrap().len(), 1);

        session.begin_transaction().unwrap();
        assert_eq!(session.get(1).unwrap().reference(0), Some(2));
    }

    #[test]
    fn conflicting_commit_dispatches_nothing() {
        let (db, batches) = create_recording_db(false);
        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(1, ACCOUNT, &[0; 8]).unwrap();
        session.commit_transaction().unwrap();

        session.begin_transaction().unwrap();
        session.update_payload(1, &[1; 8]).unwrap();

        let other = db.clone();
        thread::spawn(move || {
            let mut session = other.begin_session().unwrap();
            session.begin_transaction().unwrap();
            session.update_payload(1, &[2; 8]).unwrap();
            session.commit_transaction().unwrap();
        })
        .join()
        .unwrap();

        assert!(session.commit_transaction().is_err());
        assert_eq!(batches.lock().unwrap().len(), 2);
    }
}

// ============================================================================
// VISIBILITY
// ============================================================================

mod visibility_tests {
    use super::*;

    #[test]
    fn listener_sees_published_state() {
        let (tx, rx) = mpsc::channel::<u64>();
        let tx = Mutex::new(tx);
        let db = Database::builder()
            .trigger_listener(move |_txn: u64, events: &[TriggerEvent], _immediate: bool| {
                for event in events.iter().filter(|e| e.event_type == EventType::RowInsert) {
                    tx.lock().unwrap().send(event.object_id).unwrap();
                }
            })
            .open()
            .unwrap();
        db.register_type(TypeMetadata::new(ACCOUNT, 1));

        let reader_db = db.clone();
        let reader = thread::spawn(move || {
            let id = rx.recv().unwrap();
            let mut session = reader_db.begin_session().unwrap();
            session.begin_transaction().unwrap();
            session.get(id).unwrap().payload
        });

        let mut session = db.begin_session().unwrap();
        session.begin_transaction().unwrap();
        session.create_object(42, ACCOUNT, b"published").unwrap();
        session.commit_transaction().unwrap();

        assert_eq!(reader.join().unwrap(), b"published");
    }
}
