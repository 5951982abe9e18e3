//! # Persistence
//!
//! The in-memory database can optionally log every committed transaction to
//! a durable key/value store and rebuild itself from that store on open.
//!
//! ## Adapter Contract
//!
//! ```text
//! commit_transaction()
//!   │  (commit lock held, conflicts already validated)
//!   ├─> begin_txn(txn_id)          -> TxnHandle
//!   ├─> put(handle, id, value)     for every created / updated object
//!   ├─> remove(handle, id)         for every deleted object
//!   ├─> prepare(handle)
//!   ├─> commit(handle)             durable from here on
//!   └─> versions published in memory
//! ```
//!
//! Any adapter error before `commit` returns aborts the transaction: the
//! in-memory state has not been touched yet, so a rollback leaves nothing
//! behind. The adapter's own error is preserved as context under a
//! `DbError::Persistence`.
//!
//! `recover` returns every live key/value pair sorted by key. Values use the
//! big-endian layout in [`codec`].
//!
//! ## Adapters
//!
//! - [`MemoryPersistence`]: a shared `BTreeMap`. Clones share the store, so
//!   a test can drop a database and open a new one over the same data. Can be
//!   told to fail the next prepare or commit.
//! - [`LogPersistence`]: an append-only file of CRC64-checked frames.

pub mod codec;
mod log;
mod memory;

pub use codec::{decode_key, decode_object, encode_key, encode_object};
pub use log::LogPersistence;
pub use memory::{FailurePoint, MemoryPersistence};

use eyre::Result;

use crate::mvcc::TxnId;
use crate::storage::ObjectId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    Put { key: [u8; codec::KEY_SIZE], value: Vec<u8> },
    Remove { key: [u8; codec::KEY_SIZE] },
}

/// Writes staged by one transaction. Nothing reaches the store until the
/// handle is committed.
#[derive(Debug)]
pub struct TxnHandle {
    txn_id: TxnId,
    ops: Vec<LogOp>,
    prepared: bool,
}

impl TxnHandle {
    pub fn new(txn_id: TxnId) -> Self {
        Self {
            txn_id,
            ops: Vec::new(),
            prepared: false,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn ops(&self) -> &[LogOp] {
        &self.ops
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn stage_put(&mut self, id: ObjectId, value: &[u8]) {
        self.ops.push(LogOp::Put {
            key: codec::encode_key(id),
            value: value.to_vec(),
        });
    }

    pub fn stage_remove(&mut self, id: ObjectId) {
        self.ops.push(LogOp::Remove {
            key: codec::encode_key(id),
        });
    }

    pub fn mark_prepared(&mut self) {
        self.prepared = true;
    }

    pub fn into_ops(self) -> Vec<LogOp> {
        self.ops
    }
}

pub type RecoveredRecord = (Vec<u8>, Vec<u8>);

pub trait PersistenceAdapter: Send + Sync {
    fn begin_txn(&self, txn_id: TxnId) -> Result<TxnHandle> {
        Ok(TxnHandle::new(txn_id))
    }

    fn put(&self, handle: &mut TxnHandle, id: ObjectId, value: &[u8]) -> Result<()> {
        handle.stage_put(id, value);
        Ok(())
    }

    fn remove(&self, handle: &mut TxnHandle, id: ObjectId) -> Result<()> {
        handle.stage_remove(id);
        Ok(())
    }

    fn prepare(&self, handle: &mut TxnHandle) -> Result<()> {
        handle.mark_prepared();
        Ok(())
    }

    fn commit(&self, handle: TxnHandle) -> Result<()>;

    fn rollback(&self, handle: TxnHandle) -> Result<()> {
        drop(handle);
        Ok(())
    }

    /// Every live record, sorted by key.
    fn recover(&self) -> Result<Vec<RecoveredRecord>>;
}

/// Applies staged operations to a sorted map.
pub(crate) fn apply_ops(
    store: &mut std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
    ops: impl IntoIterator<Item = LogOp>,
) {
    for op in ops {
        match op {
            LogOp::Put { key, value } => {
                store.insert(key.to_vec(), value);
            }
            LogOp::Remove { key } => {
                store.remove(key.as_slice());
            }
        }
    }
}
