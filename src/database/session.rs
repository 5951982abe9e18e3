//! # Sessions
//!
//! A [`Session`] is one client thread's connection to a database. It owns at
//! most one open transaction and is not `Send`: the registry is keyed by
//! thread, and the transaction's snapshot slot belongs to that thread.
//!
//! ## State Machine
//!
//! ```text
//!                 begin_transaction()
//!  NoTransaction ─────────────────────> Active
//!        ^                                │
//!        │  commit ok / conflict /        │ create / get / update /
//!        │  rollback / fatal error        │ delete / scan / references
//!        └────────────────────────────────┘
//! ```
//!
//! Errors fall into two groups. Validation failures (`ObjectNotFound`,
//! `DuplicateObjectId`, `ObjectLimitExceeded`, relationship errors, ...) leave
//! the transaction open and unchanged. `OutOfMemory`, `Persistence` and
//! update conflicts end it: the session rolls back before returning the
//! error.
//!
//! Every object operation requires an open transaction and fails with
//! `NoOpenTransaction` otherwise. `rollback_transaction` without one is a
//! no-op.
//!
//! ## Usage
//!
//! ```ignore
//! let mut session = db.begin_session()?;
//! session.begin_transaction()?;
//! session.create_object(5, 7, b"hello")?;
//! session.commit_transaction()?;
//! ```

use std::marker::PhantomData;
use std::thread::ThreadId;

use eyre::{Result, WrapErr};

use super::database::{Database, SharedDatabase};
use super::transaction::ActiveTransaction;
use crate::error::{db_error, DbError};
use crate::mvcc::TxnId;
use crate::storage::{ObjectId, ObjectRecord, TypeId};

pub struct Session {
    db: Database,
    thread: ThreadId,
    active: Option<ActiveTransaction>,
    _not_send: PhantomData<*const ()>,
}

impl Session {
    pub(crate) fn open(db: Database) -> Result<Self> {
        let thread = std::thread::current().id();
        db.shared.register_session(thread)?;
        tracing::debug!(?thread, instance = %db.shared.instance_name, "session opened");
        Ok(Self {
            db,
            thread,
            active: None,
            _not_send: PhantomData,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn is_transaction_open(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the open transaction, if any.
    pub fn transaction_id(&self) -> Option<TxnId> {
        self.active.as_ref().map(ActiveTransaction::id)
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(DbError::TransactionInProgress.into());
        }

        let shared = &self.db.shared;
        let txn = shared
            .txn_manager
            .begin_txn()
            .wrap_err("failed to begin MVCC transaction")?;
        let txn_id = txn.id();
        let snapshot_ts = txn.snapshot_ts();
        self.active = Some(ActiveTransaction::new(txn));

        if let Some(listener) = shared.listener.0.as_deref() {
            listener.transaction_begin(txn_id);
        }
        tracing::debug!(txn_id, snapshot_ts, "began transaction");
        Ok(())
    }

    pub fn commit_transaction(&mut self) -> Result<()> {
        let active = self.active.take().ok_or(DbError::NoOpenTransaction)?;
        self.db.shared.commit(active)
    }

    pub fn rollback_transaction(&mut self) -> Result<()> {
        if let Some(active) = self.active.take() {
            self.db.shared.abort(active);
        }
        Ok(())
    }

    fn txn(&self) -> Result<&ActiveTransaction> {
        self.active
            .as_ref()
            .ok_or_else(|| DbError::NoOpenTransaction.into())
    }

    /// Runs a write against the open transaction and rolls it back when the
    /// write fails with an error that aborts the transaction.
    pub(crate) fn with_txn<T>(
        &mut self,
        f: impl FnOnce(&SharedDatabase, &mut ActiveTransaction) -> Result<T>,
    ) -> Result<T> {
        let shared: &SharedDatabase = &self.db.shared;
        let active = self.active.as_mut().ok_or(DbError::NoOpenTransaction)?;
        let result = f(shared, active);

        if let Err(e) = &result {
            if db_error(e).is_some_and(DbError::aborts_transaction) {
                if let Some(active) = self.active.take() {
                    tracing::warn!(txn_id = active.id(), error = %e, "forced rollback");
                    self.db.shared.abort(active);
                }
            }
        }
        result
    }

    pub fn create_object(&mut self, id: ObjectId, type_id: TypeId, payload: &[u8]) -> Result<()> {
        self.with_txn(|db, txn| txn.create_object(db, id, type_id, payload).map(|_| ()))
    }

    pub fn get(&self, id: ObjectId) -> Result<ObjectRecord> {
        self.txn()?.get(&self.db.shared, id)
    }

    /// Like [`get`](Self::get) but returns `None` for a missing object.
    pub fn try_get(&self, id: ObjectId) -> Result<Option<ObjectRecord>> {
        match self.get(id) {
            Ok(record) => Ok(Some(record)),
            Err(e) if matches!(db_error(&e), Some(DbError::ObjectNotFound(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn update_payload(&mut self, id: ObjectId, payload: &[u8]) -> Result<()> {
        self.with_txn(|db, txn| txn.update_payload(db, id, payload))
    }

    pub fn delete_object(&mut self, id: ObjectId) -> Result<()> {
        self.with_txn(|db, txn| txn.delete_object(db, id))
    }

    /// Every object of `type_id` visible to the open transaction.
    pub fn scan_type(&self, type_id: TypeId) -> Result<Vec<ObjectRecord>> {
        self.txn()?.scan_type(&self.db.shared, type_id)
    }

    /// Rolls back any open transaction and closes the session.
    pub fn end(mut self) -> Result<()> {
        self.rollback_transaction()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            self.db.shared.abort(active);
        }
        self.db.shared.unregister_session(self.thread);
        tracing::debug!(thread = ?self.thread, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread", &self.thread)
            .field("active", &self.active)
            .finish()
    }
}
