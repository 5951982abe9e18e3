//! # Type Index
//!
//! Maps each type id to the [`RecordList`] of locators created with that type.
//! Lists are created on first use. Lookups take the shared lock; only the
//! first insertion for a new type takes the exclusive one.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{Locator, RecordList, TypeId};

#[derive(Debug)]
pub struct TypeIndex {
    range_size: usize,
    lists: RwLock<HashMap<TypeId, Arc<RecordList>>>,
}

impl TypeIndex {
    pub fn new(range_size: usize) -> Self {
        Self {
            range_size,
            lists: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, type_id: TypeId) -> Option<Arc<RecordList>> {
        self.lists.read().get(&type_id).cloned()
    }

    pub fn get_or_create(&self, type_id: TypeId) -> Arc<RecordList> {
        if let Some(list) = self.get(type_id) {
            return list;
        }
        let mut lists = self.lists.write();
        Arc::clone(
            lists
                .entry(type_id)
                .or_insert_with(|| Arc::new(RecordList::new(self.range_size))),
        )
    }

    pub fn add(&self, type_id: TypeId, locator: Locator) {
        self.get_or_create(type_id).add(locator);
    }

    pub fn remove(&self, type_id: TypeId, locator: Locator) -> bool {
        self.get(type_id)
            .is_some_and(|list| list.request_deletion(locator))
    }

    pub fn type_ids(&self) -> Vec<TypeId> {
        let mut ids: Vec<_> = self.lists.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn live_entries(&self) -> usize {
        self.lists.read().values().map(|list| list.len_live()).sum()
    }

    pub fn compact_all(&self) -> usize {
        let lists: Vec<_> = self.lists.read().values().cloned().collect();
        lists.iter().map(|list| list.compact()).sum()
    }

    pub fn clear(&self) {
        self.lists.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_are_created_lazily_per_type() {
        let index = TypeIndex::new(4);
        assert!(index.get(7).is_none());

        index.add(7, 1);
        index.add(7, 2);
        index.add(9, 3);

        assert_eq!(index.get(7).unwrap().live_locators(), vec![1, 2]);
        assert_eq!(index.get(9).unwrap().live_locators(), vec![3]);
        assert_eq!(index.type_ids(), vec![7, 9]);
        assert_eq!(index.live_entries(), 3);
    }

    #[test]
    fn remove_tombstones_entry_in_its_type_list() {
        let index = TypeIndex::new(4);
        index.add(7, 1);
        index.add(7, 2);

        assert!(index.remove(7, 1));
        assert!(!index.remove(8, 2));
        assert_eq!(index.get(7).unwrap().live_locators(), vec![2]);
        assert_eq!(index.compact_all(), 1);
    }

    #[test]
    fn get_or_create_returns_same_list() {
        let index = TypeIndex::new(4);
        let a = index.get_or_create(3);
        let b = index.get_or_create(3);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
