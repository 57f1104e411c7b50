//! Per-row lock manager: wait-for graph, deadlock detection, FIFO waiters. (C8)
//!
//! One mutex protects two maps, `xid -> TxNode` and `uid -> ResNode`.
//! `acquire` either succeeds immediately, or registers a waiting edge and
//! runs a DFS cycle check before handing the caller a latch to block on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::LOCK_WAIT_TIMEOUT;
use crate::error::{DbError, Result};

struct Latch {
    inner: Mutex<bool>,
    cond: std::sync::Condvar,
}

impl Latch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(false),
            cond: std::sync::Condvar::new(),
        })
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.inner.lock().unwrap();
        while !*ready {
            let (guard, result) = self.cond.wait_timeout(ready, timeout).unwrap();
            ready = guard;
            if result.timed_out() && !*ready {
                return false;
            }
        }
        true
    }

    fn signal(&self) {
        let mut ready = self.inner.lock().unwrap();
        *ready = true;
        self.cond.notify_all();
    }
}

struct TxNode {
    held: HashSet<u64>,
    waiting: Option<u64>,
    stamp: u64,
}

struct ResNode {
    holder: Option<u64>,
    waiters: VecDeque<(u64, Arc<Latch>)>,
}

struct Inner {
    txs: HashMap<u64, TxNode>,
    resources: HashMap<u64, ResNode>,
    stamp_counter: u64,
}

pub struct LockManager {
    inner: Mutex<Inner>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                txs: HashMap::new(),
                resources: HashMap::new(),
                stamp_counter: 0,
            }),
        }
    }

    /// Acquire row `uid` for transaction `xid`, blocking (with a 30 s
    /// timeout) if it is already held by another transaction.
    pub fn acquire(&self, xid: u64, uid: u64) -> Result<()> {
        let latch = {
            let mut inner = self.inner.lock().unwrap();
            inner.txs.entry(xid).or_insert_with(|| TxNode {
                held: HashSet::new(),
                waiting: None,
                stamp: 0,
            });

            if inner.txs[&xid].held.contains(&uid) {
                return Ok(());
            }

            let res = inner.resources.entry(uid).or_insert_with(|| ResNode {
                holder: None,
                waiters: VecDeque::new(),
            });
            if res.holder.is_none() {
                res.holder = Some(xid);
                inner.txs.get_mut(&xid).unwrap().held.insert(uid);
                return Ok(());
            }

            let latch = Latch::new();
            inner
                .resources
                .get_mut(&uid)
                .unwrap()
                .waiters
                .push_back((xid, Arc::clone(&latch)));
            inner.txs.get_mut(&xid).unwrap().waiting = Some(uid);

            if inner.has_cycle(xid) {
                // Undo the edge we just added and report deadlock.
                if let Some(res) = inner.resources.get_mut(&uid) {
                    res.waiters.retain(|(w, _)| *w != xid);
                }
                inner.txs.get_mut(&xid).unwrap().waiting = None;
                return Err(DbError::Deadlock);
            }
            latch
        };

        if !latch.wait_timeout(LOCK_WAIT_TIMEOUT) {
            // Timed out: remove our waiting edge if it's still there.
            let mut inner = self.inner.lock().unwrap();
            if let Some(res) = inner.resources.get_mut(&uid) {
                res.waiters.retain(|(w, _)| *w != xid);
            }
            if let Some(tx) = inner.txs.get_mut(&xid) {
                tx.waiting = None;
            }
            return Err(DbError::LockWaitTimeout);
        }
        Ok(())
    }

    /// Release a single (xid, uid) pair without terminating the transaction.
    pub fn release(&self, xid: u64, uid: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.release_one(xid, uid);
    }

    /// Release every resource held by `xid` (called on commit/abort).
    pub fn clear(&self, xid: u64) {
        let mut inner = self.inner.lock().unwrap();
        let held: Vec<u64> = inner
            .txs
            .get(&xid)
            .map(|t| t.held.iter().copied().collect())
            .unwrap_or_default();
        for uid in held {
            inner.release_one(xid, uid);
        }
        if let Some(tx) = inner.txs.remove(&xid) {
            if let Some(uid) = tx.waiting {
                if let Some(res) = inner.resources.get_mut(&uid) {
                    res.waiters.retain(|(w, _)| *w != xid);
                }
            }
        }
    }
}

impl Inner {
    fn release_one(&mut self, xid: u64, uid: u64) {
        if let Some(tx) = self.txs.get_mut(&xid) {
            tx.held.remove(&uid);
        }
        let Some(res) = self.resources.get_mut(&uid) else {
            return;
        };
        if res.holder != Some(xid) {
            return;
        }
        res.holder = None;
        while let Some((waiter_xid, latch)) = res.waiters.pop_front() {
            // Skip waiters that already gave up (timed out / deadlocked away).
            if self
                .txs
                .get(&waiter_xid)
                .map(|t| t.waiting != Some(uid))
                .unwrap_or(true)
            {
                continue;
            }
            res.holder = Some(waiter_xid);
            if let Some(tx) = self.txs.get_mut(&waiter_xid) {
                tx.held.insert(uid);
                tx.waiting = None;
            }
            latch.signal();
            break;
        }
    }

    /// DFS from `start` over wait-for edges (waiter -> resource holder).
    /// Returns true if a cycle is found, using a rising stamp counter so
    /// each call only visits nodes touched during this call.
    fn has_cycle(&mut self, start: u64) -> bool {
        self.stamp_counter += 1;
        let stamp = self.stamp_counter;
        let mut cur = start;
        loop {
            if self.txs.get(&cur).map(|t| t.stamp) == Some(stamp) {
                return true;
            }
            if let Some(tx) = self.txs.get_mut(&cur) {
                tx.stamp = stamp;
            }
            let Some(tx) = self.txs.get(&cur) else {
                return false;
            };
            let Some(waiting_res) = tx.waiting else {
                return false;
            };
            let Some(holder) = self.resources.get(&waiting_res).and_then(|r| r.holder) else {
                return false;
            };
            cur = holder;
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn acquire_release_single_holder() {
        let lm = LockManager::new();
        lm.acquire(1, 100).unwrap();
        lm.acquire(1, 100).unwrap(); // same xid, idempotent
        lm.clear(1);
    }

    #[test]
    fn second_waiter_gets_lock_after_release() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, 100).unwrap();
        let lm2 = Arc::clone(&lm);
        let t = thread::spawn(move || {
            lm2.acquire(2, 100).unwrap();
            lm2.clear(2);
        });
        thread::sleep(Duration::from_millis(50));
        lm.clear(1);
        t.join().unwrap();
    }

    #[test]
    fn two_cycle_reports_deadlock() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, 10).unwrap();
        lm.acquire(2, 20).unwrap();

        let lm2 = Arc::clone(&lm);
        let t = thread::spawn(move || lm2.acquire(2, 10));
        thread::sleep(Duration::from_millis(50));

        let res = lm.acquire(1, 20);
        assert!(matches!(res, Err(DbError::Deadlock)));
        lm.clear(1);
        let other = t.join().unwrap();
        assert!(other.is_ok());
        lm.clear(2);
    }
}
