//! Data Items: logical variable-length records inside pages. (C4)
//!
//! On-disk shape: `[Valid:u8][Size:u16][Payload:Size]`. The 64-bit uid packs
//! `(pgno << 32) | (offset & 0xFFFF)`. Updates are bracketed with
//! `before()` / `after(xid)` / `rollback()` so the WAL can log an
//! equal-length before/after image.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};

use crate::config::PAGE_SIZE;
use crate::error::{DbError, Result};
use crate::fsm::FreeSpaceMap;
use crate::page_cache::PageCache;
use crate::wal::{LogPayload, Wal};

const VALID: u8 = 0;
const INVALID: u8 = 1;
const ITEM_HEADER_LEN: usize = 3; // Valid(1) + Size(2)
const PAGE_HEADER_LEN: usize = 2; // FSO(2)

pub fn pack_uid(pgno: u64, offset: u16) -> u64 {
    (pgno << 32) | (offset as u64 & 0xFFFF)
}

pub fn unpack_uid(uid: u64) -> (u64, u16) {
    (uid >> 32, (uid & 0xFFFF) as u16)
}

fn read_fso(data: &[u8]) -> usize {
    u16::from_be_bytes([data[0], data[1]]) as usize
}

fn write_fso(data: &mut [u8], fso: usize) {
    data[0..2].copy_from_slice(&(fso as u16).to_be_bytes());
}

pub fn fresh_page_bytes() -> Vec<u8> {
    let mut buf = vec![0u8; PAGE_SIZE];
    write_fso(&mut buf, PAGE_HEADER_LEN);
    buf
}

/// A copy of a data item's current bytes, fetched by uid.
#[derive(Debug, Clone)]
pub struct DataItemView {
    pub uid: u64,
    pub raw: Vec<u8>,
}

/// Per-uid write-lock table used to bracket `before()`/`after()`/`rollback()`.
struct WriteLockTable {
    locked: Mutex<HashSet<u64>>,
    cond: Condvar,
}

impl WriteLockTable {
    fn new() -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self, uid: u64) {
        let mut guard = self.locked.lock().unwrap();
        while guard.contains(&uid) {
            guard = self.cond.wait(guard).unwrap();
        }
        guard.insert(uid);
    }

    fn unlock(&self, uid: u64) {
        let mut guard = self.locked.lock().unwrap();
        guard.remove(&uid);
        self.cond.notify_all();
    }
}

/// Held between `before()` and `after()`/`rollback()`.
pub struct UpdateGuard {
    uid: u64,
    old_wrapped: Vec<u8>,
}

pub struct DataManager {
    cache: Arc<PageCache>,
    wal: Arc<Wal>,
    fsm: Arc<FreeSpaceMap>,
    locks: WriteLockTable,
}

impl DataManager {
    pub fn new(cache: Arc<PageCache>, wal: Arc<Wal>, fsm: Arc<FreeSpaceMap>) -> Self {
        Self {
            cache,
            wal,
            fsm,
            locks: WriteLockTable::new(),
        }
    }

    /// Wrap `raw` as a data item, place it in a page with enough free
    /// space (consulting the free-space map, allocating a new page if
    /// needed), log it, and return the new uid.
    pub fn insert(&self, xid: u64, raw: &[u8]) -> Result<u64> {
        let total_len = ITEM_HEADER_LEN + raw.len();
        if total_len > PAGE_SIZE - PAGE_HEADER_LEN {
            return Err(DbError::DataTooLarge);
        }

        let mut wrapped = Vec::with_capacity(total_len);
        wrapped.push(VALID);
        wrapped.extend_from_slice(&(raw.len() as u16).to_be_bytes());
        wrapped.extend_from_slice(raw);

        // Try a handful of FSM-suggested pages (stale entries are possible);
        // fall back to allocating a fresh page.
        for _ in 0..8 {
            let pgno = match self.fsm.poll(total_len) {
                Some(p) => p,
                None => break,
            };
            if let Some(uid) = self.try_insert_into(pgno, xid, &wrapped)? {
                return Ok(uid);
            }
        }

        let pgno = self.cache.new_page(&fresh_page_bytes())?;
        self.try_insert_into(pgno, xid, &wrapped)?
            .ok_or(DbError::Internal("failed to insert into freshly allocated page".into()))
    }

    fn try_insert_into(&self, pgno: u64, xid: u64, wrapped: &[u8]) -> Result<Option<u64>> {
        let handle = self.cache.get_page(pgno)?;
        let mut data = handle.page.data.lock().unwrap();
        let fso = read_fso(&data);
        if fso + wrapped.len() > PAGE_SIZE {
            return Ok(None);
        }
        let offset = fso as u16;
        self.wal.append(&LogPayload::Insert {
            xid,
            pgno: pgno as u32,
            offset,
            raw: wrapped.to_vec(),
        })?;
        data[fso..fso + wrapped.len()].copy_from_slice(wrapped);
        let new_fso = fso + wrapped.len();
        write_fso(&mut data, new_fso);
        drop(data);
        handle.page.mark_dirty();
        let remaining = PAGE_SIZE - new_fso;
        self.fsm.add(pgno, remaining);
        Ok(Some(pack_uid(pgno, offset)))
    }

    /// Load the current bytes for `uid`, or `None` if its slot is marked
    /// invalid (logically removed by recovery's undo pass).
    pub fn read(&self, uid: u64) -> Result<Option<DataItemView>> {
        let (pgno, offset) = unpack_uid(uid);
        let handle = self.cache.get_page(pgno)?;
        let data = handle.page.data.lock().unwrap();
        let offset = offset as usize;
        if offset + ITEM_HEADER_LEN > data.len() {
            return Ok(None);
        }
        if data[offset] != VALID {
            return Ok(None);
        }
        let size = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        let start = offset + ITEM_HEADER_LEN;
        let raw = data[start..start + size].to_vec();
        Ok(Some(DataItemView { uid, raw }))
    }

    /// Acquire the per-uid write lock and snapshot the wrapped bytes.
    pub fn before(&self, uid: u64) -> Result<UpdateGuard> {
        self.locks.lock(uid);
        let (pgno, offset) = unpack_uid(uid);
        let handle = self.cache.get_page(pgno)?;
        let data = handle.page.data.lock().unwrap();
        let offset = offset as usize;
        let size = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        let old_wrapped = data[offset..offset + ITEM_HEADER_LEN + size].to_vec();
        Ok(UpdateGuard {
            uid: uid,
            old_wrapped,
        })
    }

    /// Overwrite the payload in place (equal length to the snapshot taken
    /// by `before()`), logging an update record, and release the lock.
    pub fn after(&self, xid: u64, guard: UpdateGuard, new_payload: &[u8]) -> Result<()> {
        let new_wrapped_len = ITEM_HEADER_LEN + new_payload.len();
        if new_wrapped_len != guard.old_wrapped.len() {
            self.locks.unlock(guard.uid);
            return Err(DbError::Internal(
                "data item update requires equal-length payload".into(),
            ));
        }
        let mut new_wrapped = Vec::with_capacity(new_wrapped_len);
        new_wrapped.push(VALID);
        new_wrapped.extend_from_slice(&(new_payload.len() as u16).to_be_bytes());
        new_wrapped.extend_from_slice(new_payload);

        let (pgno, offset) = unpack_uid(guard.uid);
        self.wal.append(&LogPayload::Update {
            xid,
            uid: guard.uid,
            old: guard.old_wrapped.clone(),
            new: new_wrapped.clone(),
        })?;
        let handle = self.cache.get_page(pgno)?;
        let mut data = handle.page.data.lock().unwrap();
        let offset = offset as usize;
        data[offset..offset + new_wrapped.len()].copy_from_slice(&new_wrapped);
        drop(data);
        handle.page.mark_dirty();
        self.locks.unlock(guard.uid);
        Ok(())
    }

    /// Restore the pre-`before()` bytes without logging, and release the lock.
    pub fn rollback(&self, guard: UpdateGuard) -> Result<()> {
        let (pgno, offset) = unpack_uid(guard.uid);
        let handle = self.cache.get_page(pgno)?;
        let mut data = handle.page.data.lock().unwrap();
        let offset = offset as usize;
        data[offset..offset + guard.old_wrapped.len()].copy_from_slice(&guard.old_wrapped);
        drop(data);
        handle.page.mark_dirty();
        self.locks.unlock(guard.uid);
        Ok(())
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn close(&self) -> Result<()> {
        self.cache.close()?;
        self.wal.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DataManager {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::open(dir.path().join("t.db"), 64).unwrap();
        let (wal, _) = Wal::open(dir.path().join("t.log"), 1 << 16).unwrap();
        // Keep the tempdir alive for the duration of the test process.
        std::mem::forget(dir);
        DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new()))
    }

    #[test]
    fn insert_and_read_roundtrip() {
        let dm = manager();
        let uid = dm.insert(1, b"hello world").unwrap();
        let view = dm.read(uid).unwrap().unwrap();
        assert_eq!(view.raw, b"hello world");
    }

    #[test]
    fn equal_length_update_roundtrip() {
        let dm = manager();
        let uid = dm.insert(1, b"AAAAAAAA").unwrap();
        let guard = dm.before(uid).unwrap();
        dm.after(1, guard, b"BBBBBBBB").unwrap();
        let view = dm.read(uid).unwrap().unwrap();
        assert_eq!(view.raw, b"BBBBBBBB");
    }

    #[test]
    fn rollback_restores_bytes() {
        let dm = manager();
        let uid = dm.insert(1, b"AAAAAAAA").unwrap();
        let guard = dm.before(uid).unwrap();
        dm.rollback(guard).unwrap();
        let view = dm.read(uid).unwrap().unwrap();
        assert_eq!(view.raw, b"AAAAAAAA");
    }

    #[test]
    fn oversized_insert_rejected() {
        let dm = manager();
        let err = dm.insert(1, &vec![0u8; PAGE_SIZE]).unwrap_err();
        assert!(matches!(err, DbError::DataTooLarge));
    }
}
