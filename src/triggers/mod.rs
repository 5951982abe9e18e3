//! # Trigger Dispatch
//!
//! A database can carry one [`TriggerListener`], set when it is built. After
//! every successful commit that changed at least one row the listener gets
//! the transaction's row events in operation order, followed by a single
//! `TransactionCommit` event:
//!
//! ```text
//! txn 12: create(5) update(5) delete(9) commit
//!
//! commit_trigger(12, [
//!     RowInsert(type 7, id 5),
//!     RowUpdate(type 7, id 5, fields [1]),
//!     RowDelete(type 3, id 9),
//!     TransactionCommit,
//! ], immediate)
//! ```
//!
//! The listener runs on the committing thread after the commit lock is
//! released and the new state is visible to every session that begins a
//! transaction from then on. It must not block for long: the committing
//! session does not return until the listener does.
//!
//! `transaction_begin` and `transaction_rollback` are optional hooks for
//! listeners that track transaction lifetimes.

use std::fmt;

use crate::catalog::FieldPositions;
use crate::mvcc::TxnId;
use crate::storage::{ObjectId, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    RowInsert,
    RowUpdate,
    RowDelete,
    TransactionBegin,
    TransactionCommit,
    TransactionRollback,
}

impl EventType {
    pub fn is_row_event(self) -> bool {
        matches!(
            self,
            EventType::RowInsert | EventType::RowUpdate | EventType::RowDelete
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub event_type: EventType,
    pub type_id: TypeId,
    pub object_id: ObjectId,
    pub changed_fields: FieldPositions,
}

impl TriggerEvent {
    pub fn row(event_type: EventType, type_id: TypeId, object_id: ObjectId) -> Self {
        Self {
            event_type,
            type_id,
            object_id,
            changed_fields: FieldPositions::new(),
        }
    }

    pub fn update(type_id: TypeId, object_id: ObjectId, changed_fields: FieldPositions) -> Self {
        Self {
            event_type: EventType::RowUpdate,
            type_id,
            object_id,
            changed_fields,
        }
    }

    pub fn transaction(event_type: EventType) -> Self {
        Self {
            event_type,
            type_id: 0,
            object_id: 0,
            changed_fields: FieldPositions::new(),
        }
    }
}

pub trait TriggerListener: Send + Sync {
    fn commit_trigger(&self, txn_id: TxnId, events: &[TriggerEvent], immediate: bool);

    fn transaction_begin(&self, _txn_id: TxnId) {}

    fn transaction_rollback(&self, _txn_id: TxnId) {}
}

impl<F> TriggerListener for F
where
    F: Fn(TxnId, &[TriggerEvent], bool) + Send + Sync,
{
    fn commit_trigger(&self, txn_id: TxnId, events: &[TriggerEvent], immediate: bool) {
        self(txn_id, events, immediate)
    }
}

/// Appends the commit marker and hands the batch to `listener`. Does nothing
/// when the transaction produced no row events.
pub(crate) fn dispatch_commit(
    listener: &dyn TriggerListener,
    txn_id: TxnId,
    mut events: Vec<TriggerEvent>,
    immediate: bool,
) -> bool {
    if !events.iter().any(|e| e.event_type.is_row_event()) {
        return false;
    }
    events.push(TriggerEvent::transaction(EventType::TransactionCommit));
    tracing::debug!(txn_id, events = events.len(), "dispatching commit trigger");
    listener.commit_trigger(txn_id, &events, immediate);
    true
}

pub(crate) struct ListenerSlot(pub(crate) Option<Box<dyn TriggerListener>>);

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Some(<listener>)"
        } else {
            "None"
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use smallvec::smallvec;
    use std::sync::Arc;

    #[test]
    fn closure_listener_receives_events_with_commit_marker() {
        let seen: Arc<Mutex<Vec<(TxnId, Vec<TriggerEvent>, bool)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let listener = move |txn: TxnId, events: &[TriggerEvent], immediate: bool| {
            sink.lock().push((txn, events.to_vec(), immediate));
        };

        let events = vec![
            TriggerEvent::row(EventType::RowInsert, 7, 1),
            TriggerEvent::update(7, 1, smallvec![2]),
        ];
        assert!(dispatch_commit(&listener, 4, events, true));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (txn, events, immediate) = &seen[0];
        assert_eq!(*txn, 4);
        assert!(*immediate);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].changed_fields.as_slice(), &[2]);
        assert_eq!(events[2].event_type, EventType::TransactionCommit);
    }

    #[test]
    fn no_row_events_means_no_dispatch() {
        let listener = |_: TxnId, _: &[TriggerEvent], _: bool| panic!("must not be called");
        assert!(!dispatch_commit(&listener, 1, Vec::new(), false));
    }

    #[test]
    fn default_hooks_are_noops() {
        struct Counting;
        impl TriggerListener for Counting {
            fn commit_trigger(&self, _: TxnId, _: &[TriggerEvent], _: bool) {}
        }
        Counting.transaction_begin(1);
        Counting.transaction_rollback(1);
    }
}
