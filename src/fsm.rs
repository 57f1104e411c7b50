//! Free-space map: O(1)-expected selection of a page with enough slack. (C6)

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::{FSM_BUCKETS, PAGE_SIZE};

struct Inner {
    buckets: Vec<VecDeque<(u64, usize)>>,
}

pub struct FreeSpaceMap {
    inner: Mutex<Inner>,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: (0..FSM_BUCKETS).map(|_| VecDeque::new()).collect(),
            }),
        }
    }

    fn bucket_width() -> usize {
        PAGE_SIZE / FSM_BUCKETS
    }

    fn bucket_of(free_bytes: usize) -> usize {
        (free_bytes / Self::bucket_width()).min(FSM_BUCKETS - 1)
    }

    /// Record that `pgno` currently has `free` bytes of slack.
    pub fn add(&self, pgno: u64, free: usize) {
        let bucket = Self::bucket_of(free);
        self.inner.lock().unwrap().buckets[bucket].push_back((pgno, free));
    }

    /// Pop a page reported to have at least `required` bytes free. Entries
    /// may be stale (the page's real free space may have shrunk since it was
    /// added); callers must re-check after pinning the page.
    pub fn poll(&self, required: usize) -> Option<u64> {
        let start = (required / Self::bucket_width()) + 1;
        let mut inner = self.inner.lock().unwrap();
        for bucket in start..FSM_BUCKETS {
            if let Some((pgno, _)) = inner.buckets[bucket].pop_front() {
                return Some(pgno);
            }
        }
        None
    }
}

impl Default for FreeSpaceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_picks_bucket_above_requirement() {
        let fsm = FreeSpaceMap::new();
        fsm.add(1, 100);
        fsm.add(2, PAGE_SIZE - 10);
        assert_eq!(fsm.poll(50), Some(1));
        assert_eq!(fsm.poll(50), Some(2));
        assert_eq!(fsm.poll(50), None);
    }

    #[test]
    fn fifo_within_bucket() {
        let fsm = FreeSpaceMap::new();
        fsm.add(1, 500);
        fsm.add(2, 510);
        assert_eq!(fsm.poll(10), Some(1));
        assert_eq!(fsm.poll(10), Some(2));
    }

    #[test]
    fn clamps_values_above_max_bucket() {
        let fsm = FreeSpaceMap::new();
        fsm.add(9, PAGE_SIZE * 2);
        assert_eq!(fsm.poll(PAGE_SIZE - 1), Some(9));
    }
}
