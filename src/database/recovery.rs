//! # Recovery
//!
//! On open, a database with a persistence adapter rebuilds its in-memory
//! state from `recover()`:
//!
//! ```text
//! for (key, value) in adapter.recover()      (sorted by id)
//!     record   = decode_object(key, value)
//!     locator  = allocate_locator()
//!     offset   = heap.allocate(record)      copy with locator back-reference
//!     table    [locator] = (BOOTSTRAP_TS, offset)
//!     id_index [id]      = locator
//!     type_index[type]  += locator
//! next_object_id = max(id) + 1            (saturating at u64::MAX)
//! ```
//!
//! Recovered versions carry `BOOTSTRAP_TS`, so they are visible to every
//! snapshot. Recovery runs before the database handle exists; no session can
//! observe a half-loaded state.

use eyre::{Result, WrapErr};

use super::commit::persistence_error;
use super::database::SharedDatabase;
use crate::mvcc::BOOTSTRAP_TS;
use crate::persistence::decode_object;
use crate::storage::LocatorVersion;

impl SharedDatabase {
    /// Loads every persisted object. Returns the number of objects loaded.
    pub(crate) fn recover(&self) -> Result<usize> {
        let Some(adapter) = self.persistence.as_deref() else {
            return Ok(0);
        };

        let records = adapter
            .recover()
            .map_err(|e| persistence_error(e, "recovery"))?;

        let mut loaded = 0;
        for (key, value) in records {
            let mut record =
                decode_object(&key, &value).wrap_err("failed to decode persisted object")?;
            let locator = self.locators.allocate_locator()?;
            record.locator = locator;

            let bytes = record.to_heap_bytes();
            let offset = self.heap.allocate(bytes.len())?;
            // SAFETY: freshly allocated and the database is not shared yet.
            unsafe { self.heap.write(offset, &bytes)? };

            self.table.install(
                locator,
                LocatorVersion {
                    commit_ts: BOOTSTRAP_TS,
                    offset,
                    len: bytes.len() as u32,
                    id: record.id,
                    type_id: record.type_id,
                },
            );
            self.id_index
                .try_insert(record.id, locator)
                .wrap_err_with(|| format!("recovered object {} twice", record.id))?;
            self.type_index.add(record.type_id, locator);
            loaded += 1;
        }

        if let Some(max_id) = self.id_index.max_id() {
            self.observe_object_id(max_id);
        }

        tracing::info!(
            instance = %self.instance_name,
            objects = loaded,
            heap_used_slots = self.heap.stats().used_slots,
            "recovered persisted objects"
        );
        Ok(loaded)
    }
}
