//! In-process persistence backed by a shared `BTreeMap`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use parking_lot::Mutex;

use super::{apply_ops, PersistenceAdapter, RecoveredRecord, TxnHandle};
use crate::storage::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    Put,
    Prepare,
    Commit,
}

#[derive(Debug, Default)]
struct Shared {
    store: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_next: Mutex<Option<FailurePoint>>,
    commits: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    shared: Arc<Shared>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call at `point` fail once.
    pub fn fail_next(&self, point: FailurePoint) {
        *self.shared.fail_next.lock() = Some(point);
    }

    fn check_failure(&self, point: FailurePoint) -> Result<()> {
        let mut fail_next = self.shared.fail_next.lock();
        if *fail_next == Some(point) {
            *fail_next = None;
            bail!("injected {:?} failure", point);
        }
        Ok(())
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.shared.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn put(&self, handle: &mut TxnHandle, id: ObjectId, value: &[u8]) -> Result<()> {
        self.check_failure(FailurePoint::Put)?;
        handle.stage_put(id, value);
        Ok(())
    }

    fn prepare(&self, handle: &mut TxnHandle) -> Result<()> {
        self.check_failure(FailurePoint::Prepare)?;
        handle.mark_prepared();
        Ok(())
    }

    fn commit(&self, handle: TxnHandle) -> Result<()> {
        self.check_failure(FailurePoint::Commit)?;
        apply_ops(&mut self.shared.store.lock(), handle.into_ops());
        self.shared.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn recover(&self) -> Result<Vec<RecoveredRecord>> {
        Ok(self
            .shared
            .store
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
