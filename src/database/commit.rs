//! # Commit, Rollback and Reclamation
//!
//! ## Commit Pipeline
//!
//! ```text
//! commit(active)
//!   │
//!   ├── lock commit_lock
//!   │     ├── 1. validate     newest committed ts of every pre-existing
//!   │     │                   write-set object must be <= snapshot
//!   │     ├── 2. persist      begin / put / remove / prepare / commit
//!   │     ├── 3. install      commit_ts = next_commit_ts(); one version per
//!   │     │                   write-set entry (tombstone for deletes)
//!   │     ├── 4. index        new objects appended to their type's list
//!   │     └── 5. publish      visible_ts = commit_ts (single atomic store)
//!   ├── unlock
//!   ├── 6. release snapshot slot
//!   ├── 7. dispatch triggers
//!   └── 8. collect garbage
//! ```
//!
//! A failure in step 1 or 2 leaves the published state untouched; the
//! transaction is rolled back and the error returned. Conflicts surface as
//! `TransactionUpdateConflict`, adapter failures as `Persistence`.
//!
//! New objects are indexed before the publish so that any snapshot able to
//! see them also finds them in a scan. Older snapshots find the locator in
//! the list but see no version for it.
//!
//! ## Reclamation
//!
//! Every pre-existing object in a committed write-set had a version replaced,
//! so its locator is retired with the commit timestamp. Once the watermark
//! reaches that timestamp the chain is pruned: replaced versions go back to
//! the heap, and a chain that is down to its tombstone releases the object
//! entirely (record list entry, id binding, locator), in that order.

use eyre::{Report, Result};

use super::database::SharedDatabase;
use super::transaction::ActiveTransaction;
use crate::error::DbError;
use crate::mvcc::{GcStats, TxnId, TxnState};
use crate::persistence::{encode_object, PersistenceAdapter};
use crate::storage::LocatorVersion;
use crate::triggers::{dispatch_commit, TriggerEvent};

impl SharedDatabase {
    pub(crate) fn commit(&self, mut active: ActiveTransaction) -> Result<()> {
        let txn_id = active.id();

        if active.write_count() == 0 {
            let events = active.take_events();
            active.finish(TxnState::Committed);
            tracing::debug!(txn_id, "committed read-only transaction");
            self.dispatch_triggers(txn_id, events);
            // The released snapshot may have been the last one holding back
            // the watermark.
            self.collect_garbage();
            return Ok(());
        }

        let outcome = {
            let _commit = self.commit_lock.lock();
            self.validate(&active)
                .and_then(|()| self.persist(&active))
                .map(|()| self.install(&active))
        };

        let commit_ts = match outcome {
            Ok(commit_ts) => commit_ts,
            Err(e) => {
                self.abort(active);
                return Err(e);
            }
        };

        let writes = active.write_count();
        let events = active.take_events();
        // Published: the overlay's heap slots now belong to the table.
        let _ = active.drain_writes();
        active.finish(TxnState::Committed);
        tracing::debug!(txn_id, commit_ts, writes, "committed transaction");

        self.dispatch_triggers(txn_id, events);
        self.collect_garbage();
        Ok(())
    }

    fn validate(&self, active: &ActiveTransaction) -> Result<()> {
        let snapshot_ts = active.snapshot_ts();
        for (locator, latest) in active.committed_bases(self) {
            if latest.map_or(true, |version| version.commit_ts > snapshot_ts) {
                tracing::warn!(
                    txn_id = active.id(),
                    locator,
                    snapshot_ts,
                    "update conflict"
                );
                return Err(DbError::TransactionUpdateConflict {
                    txn_id: active.id(),
                    locator,
                }
                .into());
            }
        }
        Ok(())
    }

    fn persist(&self, active: &ActiveTransaction) -> Result<()> {
        let Some(adapter) = self.persistence.as_deref() else {
            return Ok(());
        };
        let txn_id = active.id();

        let result = self.log_transaction(adapter, active);
        if let Err(e) = &result {
            tracing::warn!(txn_id, error = %e, "persistence failed, rolling back");
        }
        result.map_err(|e| persistence_error(e, &format!("transaction {txn_id}")))
    }

    fn log_transaction(
        &self,
        adapter: &dyn PersistenceAdapter,
        active: &ActiveTransaction,
    ) -> Result<()> {
        let mut handle = adapter.begin_txn(active.id())?;

        let staged = (|| -> Result<()> {
            for (_, entry) in active.writes_in_order() {
                match entry.version {
                    Some(version) => {
                        let record = self.read_private(version)?;
                        adapter.put(&mut handle, entry.id, &encode_object(&record))?;
                    }
                    None => adapter.remove(&mut handle, entry.id)?,
                }
            }
            adapter.prepare(&mut handle)
        })();

        if let Err(e) = staged {
            if let Err(rollback) = adapter.rollback(handle) {
                tracing::warn!(error = %rollback, "persistence rollback failed");
            }
            return Err(e);
        }
        adapter.commit(handle)
    }

    fn install(&self, active: &ActiveTransaction) -> u64 {
        let commit_ts = self.txn_manager.next_commit_ts();

        for (locator, entry) in active.writes_in_order() {
            let (offset, len) = entry.version.map_or((0, 0), |v| (v.offset, v.len));
            self.table.install(
                locator,
                LocatorVersion {
                    commit_ts,
                    offset,
                    len,
                    id: entry.id,
                    type_id: entry.type_id,
                },
            );
            if entry.existed {
                self.retired.retire(commit_ts, locator);
            } else {
                self.type_index.add(entry.type_id, locator);
            }
        }

        self.txn_manager.publish(commit_ts);
        commit_ts
    }

    /// Discards the overlay: private versions go back to the heap, objects
    /// created by the transaction give back their id and locator.
    pub(crate) fn abort(&self, mut active: ActiveTransaction) {
        let txn_id = active.id();
        let writes = active.write_count();

        for (locator, entry) in active.drain_writes() {
            if let Some(version) = entry.version {
                self.free_private(version);
            }
            if !entry.existed {
                self.id_index.remove(entry.id, locator);
                self.locators.release_locator(locator);
            }
        }
        active.finish(TxnState::Aborted);

        if let Some(listener) = self.listener.0.as_deref() {
            listener.transaction_rollback(txn_id);
        }
        tracing::debug!(txn_id, writes, "rolled back transaction");
        self.collect_garbage();
    }

    fn dispatch_triggers(&self, txn_id: TxnId, events: Vec<TriggerEvent>) {
        if let Some(listener) = self.listener.0.as_deref() {
            dispatch_commit(listener, txn_id, events, self.immediate_triggers);
        }
    }

    pub(crate) fn collect_garbage(&self) -> GcStats {
        let _commit = self.commit_lock.lock();
        let watermark = self.txn_manager.get_global_watermark();
        let mut stats = GcStats {
            watermark,
            ..GcStats::default()
        };

        for locator in self.retired.drain_ready(watermark) {
            let pruned = self.table.prune(locator, watermark);
            for version in pruned.dropped.iter().filter(|v| !v.is_tombstone()) {
                if let Err(e) = self.heap.free(version.offset, version.len as usize) {
                    tracing::warn!(locator, offset = version.offset, error = %e, "failed to free version");
                    continue;
                }
                stats.versions_freed += 1;
            }
            if let Some(tombstone) = pruned.released {
                self.type_index.remove(tombstone.type_id, locator);
                self.id_index.remove(tombstone.id, locator);
                self.locators.release_locator(locator);
                stats.locators_released += 1;
            }
        }

        if stats.versions_freed > 0 || stats.locators_released > 0 {
            tracing::debug!(
                watermark,
                versions_freed = stats.versions_freed,
                locators_released = stats.locators_released,
                "reclaimed versions"
            );
        }
        stats
    }
}

/// Marks an adapter failure as a typed persistence error, keeping the
/// adapter's report as the source.
pub(crate) fn persistence_error(e: Report, what: &str) -> Report {
    let message = format!("{what}: {e}");
    e.wrap_err(DbError::Persistence(message))
}
