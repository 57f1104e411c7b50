//! MVCC entries and visibility: transaction lifecycle, RC/RR visibility,
//! version-skip detection. (C7)

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::data_item::DataManager;
use crate::error::{DbError, Result};
use crate::lock_manager::LockManager;
use crate::xid::{XidStore, SUPER_XID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
}

impl IsolationLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().replace('_', " ").as_str() {
            "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
            _ => None,
        }
    }
}

struct Transaction {
    level: IsolationLevel,
    snapshot: HashSet<u64>,
    err: Option<DbError>,
    terminated: bool,
}

pub struct MvccEngine {
    xid_store: Arc<XidStore>,
    data: Arc<DataManager>,
    locks: Arc<LockManager>,
    txs: Mutex<HashMap<u64, Transaction>>,
}

impl MvccEngine {
    pub fn new(xid_store: Arc<XidStore>, data: Arc<DataManager>, locks: Arc<LockManager>) -> Self {
        Self {
            xid_store,
            data,
            locks,
            txs: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn data_manager(&self) -> &Arc<DataManager> {
        &self.data
    }

    pub fn begin(&self, level: IsolationLevel) -> Result<u64> {
        let mut txs = self.txs.lock().unwrap();
        let xid = self.xid_store.begin()?;
        let snapshot = if level == IsolationLevel::RepeatableRead {
            txs.keys().copied().collect()
        } else {
            HashSet::new()
        };
        txs.insert(
            xid,
            Transaction {
                level,
                snapshot,
                err: None,
                terminated: false,
            },
        );
        Ok(xid)
    }

    fn check_tx(&self, xid: u64) -> Result<(IsolationLevel, HashSet<u64>)> {
        if xid == SUPER_XID {
            return Ok((IsolationLevel::ReadCommitted, HashSet::new()));
        }
        let txs = self.txs.lock().unwrap();
        match txs.get(&xid) {
            None => Err(DbError::NoTransaction),
            Some(tx) if tx.err.is_some() => Err(tx.err.clone().unwrap()),
            Some(tx) if tx.terminated => Err(DbError::TransactionTerminated),
            Some(tx) => Ok((tx.level, tx.snapshot.clone())),
        }
    }

    fn poison(&self, xid: u64, err: DbError) -> DbError {
        let mut txs = self.txs.lock().unwrap();
        if let Some(tx) = txs.get_mut(&xid) {
            tx.err = Some(err.clone());
            tx.terminated = true;
        }
        drop(txs);
        let _ = self.xid_store.abort(xid);
        self.locks.clear(xid);
        err
    }

    pub fn commit(&self, xid: u64) -> Result<()> {
        self.check_tx(xid)?;
        self.data.wal().flush(self.data.wal().current_lsn())?;
        self.xid_store.commit(xid)?;
        self.locks.clear(xid);
        self.txs.lock().unwrap().remove(&xid);
        Ok(())
    }

    pub fn abort(&self, xid: u64) -> Result<()> {
        self.check_tx(xid)?;
        self.xid_store.abort(xid)?;
        self.locks.clear(xid);
        self.txs.lock().unwrap().remove(&xid);
        Ok(())
    }

    fn is_committed(&self, xid: u64) -> Result<bool> {
        if xid == SUPER_XID {
            return Ok(true);
        }
        self.xid_store.is_committed(xid)
    }

    fn visible(
        &self,
        self_xid: u64,
        level: IsolationLevel,
        snapshot: &HashSet<u64>,
        xmin: u64,
        xmax: u64,
    ) -> Result<bool> {
        if xmin == self_xid && xmax == 0 {
            return Ok(true);
        }
        match level {
            IsolationLevel::ReadCommitted => Ok(self.is_committed(xmin)?
                && (xmax == 0 || (xmax != self_xid && !self.is_committed(xmax)?))),
            IsolationLevel::RepeatableRead => Ok(self.is_committed(xmin)?
                && xmin < self_xid
                && !snapshot.contains(&xmin)
                && (xmax == 0
                    || (xmax != self_xid
                        && (!self.is_committed(xmax)?
                            || xmax > self_xid
                            || snapshot.contains(&xmax))))),
        }
    }

    fn version_skip(
        &self,
        self_xid: u64,
        level: IsolationLevel,
        snapshot: &HashSet<u64>,
        xmax: u64,
    ) -> Result<bool> {
        if level != IsolationLevel::RepeatableRead || xmax == 0 {
            return Ok(false);
        }
        Ok(self.is_committed(xmax)? && (xmax > self_xid || snapshot.contains(&xmax)))
    }

    fn decode(raw: &[u8]) -> (u64, u64, &[u8]) {
        let xmin = u64::from_be_bytes(raw[0..8].try_into().unwrap());
        let xmax = u64::from_be_bytes(raw[8..16].try_into().unwrap());
        (xmin, xmax, &raw[16..])
    }

    /// Read the body bytes of `uid` if visible to `xid`'s snapshot.
    pub fn read(&self, xid: u64, uid: u64) -> Result<Option<Vec<u8>>> {
        let (level, snapshot) = self.check_tx(xid)?;
        let Some(item) = self.data.read(uid)? else {
            return Ok(None);
        };
        let (xmin, xmax, body) = Self::decode(&item.raw);
        if self.visible(xid, level, &snapshot, xmin, xmax)? {
            Ok(Some(body.to_vec()))
        } else {
            Ok(None)
        }
    }

    /// Insert a new MVCC version owned by `xid`. `body` is the encoded row.
    pub fn insert(&self, xid: u64, body: &[u8]) -> Result<u64> {
        self.check_tx(xid)?;
        let mut payload = Vec::with_capacity(16 + body.len());
        payload.extend_from_slice(&xid.to_be_bytes());
        payload.extend_from_slice(&0u64.to_be_bytes());
        payload.extend_from_slice(body);
        self.data.insert(xid, &payload)
    }

    /// Take the row lock, re-check visibility, and (if visible and no
    /// RR write-write conflict) return the current body, holding the lock
    /// until the transaction terminates.
    pub fn read_for_update(&self, xid: u64, uid: u64) -> Result<Option<Vec<u8>>> {
        let (level, snapshot) = self.check_tx(xid)?;
        self.locks
            .acquire(xid, uid)
            .map_err(|e| self.poison(xid, e))?;
        let Some(item) = self.data.read(uid)? else {
            return Ok(None);
        };
        let (xmin, xmax, body) = Self::decode(&item.raw);
        if !self.visible(xid, level, &snapshot, xmin, xmax)? {
            return Ok(None);
        }
        if self.version_skip(xid, level, &snapshot, xmax)? {
            return Err(self.poison(xid, DbError::ConcurrentUpdate));
        }
        Ok(Some(body.to_vec()))
    }

    /// Overwrite a version's body in place, preserving its xmin/xmax. Used
    /// internally by the super-transaction's own structures (B+ tree nodes,
    /// catalog fixups) whose body length never changes across an update.
    pub fn overwrite(&self, xid: u64, uid: u64, new_body: &[u8]) -> Result<()> {
        let item = self
            .data
            .read(uid)?
            .ok_or(DbError::NullEntry)?;
        let (xmin, xmax, _) = Self::decode(&item.raw);
        let mut new_payload = Vec::with_capacity(16 + new_body.len());
        new_payload.extend_from_slice(&xmin.to_be_bytes());
        new_payload.extend_from_slice(&xmax.to_be_bytes());
        new_payload.extend_from_slice(new_body);
        let guard = self.data.before(uid)?;
        self.data.after(xid, guard, &new_payload)
    }

    /// Mark the current version of `uid` deleted by `xid`.
    pub fn delete(&self, xid: u64, uid: u64) -> Result<bool> {
        let (level, snapshot) = self.check_tx(xid)?;
        self.locks
            .acquire(xid, uid)
            .map_err(|e| self.poison(xid, e))?;
        let Some(item) = self.data.read(uid)? else {
            return Ok(false);
        };
        let (xmin, xmax, body) = Self::decode(&item.raw);
        if !self.visible(xid, level, &snapshot, xmin, xmax)? {
            return Ok(false);
        }
        if self.version_skip(xid, level, &snapshot, xmax)? {
            return Err(self.poison(xid, DbError::ConcurrentUpdate));
        }
        let mut new_payload = Vec::with_capacity(16 + body.len());
        new_payload.extend_from_slice(&xmin.to_be_bytes());
        new_payload.extend_from_slice(&xid.to_be_bytes());
        new_payload.extend_from_slice(body);
        let guard = self.data.before(uid)?;
        self.data.after(xid, guard, &new_payload)?;
        Ok(true)
    }
}
