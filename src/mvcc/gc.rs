//! # Epoch Reclamation
//!
//! Superseded and deleted versions cannot be freed at commit time: older
//! snapshots may still be reading them. Each commit retires the locators it
//! replaced a version of, tagged with the commit timestamp:
//!
//! ```text
//! retired:  (ts=4, L7) (ts=4, L9) (ts=6, L7) (ts=9, L2)
//!                                            ^ watermark = 6
//! drain_ready(6) -> [L7, L9, L7]
//! ```
//!
//! Commits push under the database commit lock, so the queue is ordered by
//! timestamp and draining is a pop from the front. The caller then prunes
//! each drained locator's version chain up to the watermark; a chain that
//! ends up holding only its tombstone releases the locator.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::storage::Locator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Retired {
    commit_ts: u64,
    locator: Locator,
}

#[derive(Debug, Default)]
pub struct RetiredList {
    queue: Mutex<VecDeque<Retired>>,
}

/// What one reclamation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub watermark: u64,
    pub versions_freed: usize,
    pub locators_released: usize,
}

impl RetiredList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&self, commit_ts: u64, locator: Locator) {
        let mut queue = self.queue.lock();
        debug_assert!(queue.back().map_or(true, |r| r.commit_ts <= commit_ts));
        queue.push_back(Retired { commit_ts, locator });
    }

    /// Removes and returns every locator retired at or below `watermark`.
    pub fn drain_ready(&self, watermark: u64) -> Vec<Locator> {
        let mut queue = self.queue.lock();
        let ready = queue
            .iter()
            .take_while(|r| r.commit_ts <= watermark)
            .count();
        queue.drain(..ready).map(|r| r.locator).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn oldest_ts(&self) -> Option<u64> {
        self.queue.lock().front().map(|r| r.commit_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_ready_stops_at_watermark() {
        let retired = RetiredList::new();
        retired.retire(4, 7);
        retired.retire(4, 9);
        retired.retire(6, 7);
        retired.retire(9, 2);

        assert_eq!(retired.drain_ready(3), Vec::<Locator>::new());
        assert_eq!(retired.drain_ready(6), vec![7, 9, 7]);
        assert_eq!(retired.len(), 1);
        assert_eq!(retired.oldest_ts(), Some(9));
    }

    #[test]
    fn drain_ready_on_empty_list() {
        let retired = RetiredList::new();
        assert!(retired.drain_ready(u64::MAX).is_empty());
        assert!(retired.is_empty());
    }
}
