//! REDO/UNDO crash recovery driven by the WAL. (C5)
//!
//! Runs once at database open when the registry finds an existing `.xid`
//! file for the database being opened. Three passes: shrink the heap file
//! to the highest page any log record references, REDO committed/aborted
//! work, then UNDO whatever was left active when the process died.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::data_item::unpack_uid;
use crate::error::Result;
use crate::page_cache::PageCache;
use crate::wal::{LogPayload, LogRecord};
use crate::xid::XidStore;

const INVALID: u8 = 1;

fn max_pgno(records: &[LogRecord]) -> u64 {
    records
        .iter()
        .map(|r| match &r.payload {
            LogPayload::Insert { pgno, .. } => *pgno as u64,
            LogPayload::Update { uid, .. } => unpack_uid(*uid).0,
        })
        .max()
        .unwrap_or(0)
}

fn redo_insert(cache: &Arc<PageCache>, pgno: u64, offset: u16, raw: &[u8]) -> Result<()> {
    let handle = cache.get_page(pgno)?;
    let mut data = handle.page.data.lock().unwrap();
    let offset = offset as usize;
    data[offset..offset + raw.len()].copy_from_slice(raw);
    let fso = u16::from_be_bytes([data[0], data[1]]) as usize;
    let new_fso = fso.max(offset + raw.len());
    data[0..2].copy_from_slice(&(new_fso as u16).to_be_bytes());
    drop(data);
    handle.page.mark_dirty();
    Ok(())
}

fn redo_update(cache: &Arc<PageCache>, pgno: u64, offset: u16, new: &[u8]) -> Result<()> {
    let handle = cache.get_page(pgno)?;
    let mut data = handle.page.data.lock().unwrap();
    let offset = offset as usize;
    data[offset..offset + new.len()].copy_from_slice(new);
    drop(data);
    handle.page.mark_dirty();
    Ok(())
}

fn undo_insert(cache: &Arc<PageCache>, pgno: u64, offset: u16) -> Result<()> {
    let handle = cache.get_page(pgno)?;
    let mut data = handle.page.data.lock().unwrap();
    data[offset as usize] = INVALID;
    drop(data);
    handle.page.mark_dirty();
    Ok(())
}

fn undo_update(cache: &Arc<PageCache>, pgno: u64, offset: u16, old: &[u8]) -> Result<()> {
    let handle = cache.get_page(pgno)?;
    let mut data = handle.page.data.lock().unwrap();
    let offset = offset as usize;
    data[offset..offset + old.len()].copy_from_slice(old);
    drop(data);
    handle.page.mark_dirty();
    Ok(())
}

/// Run the three recovery passes. `records` are the WAL's validated
/// records (the WAL already truncated any corrupt tail at open time).
pub fn recover(cache: &Arc<PageCache>, xid_store: &XidStore, records: &[LogRecord]) -> Result<()> {
    // Pass 1: size scan.
    let target = max_pgno(records).max(1);
    cache.truncate_to(target)?;

    // Pass 2: REDO every record whose xid is not still active.
    let mut active_cache: HashMap<u64, bool> = HashMap::new();
    let mut is_active = |xid_store: &XidStore, xid: u64| -> Result<bool> {
        if let Some(v) = active_cache.get(&xid) {
            return Ok(*v);
        }
        let v = xid_store.is_active(xid)?;
        active_cache.insert(xid, v);
        Ok(v)
    };

    for record in records {
        match &record.payload {
            LogPayload::Insert {
                xid, pgno, offset, raw,
            } => {
                if !is_active(xid_store, *xid)? {
                    redo_insert(cache, *pgno as u64, *offset, raw)?;
                }
            }
            LogPayload::Update { xid, uid, new, .. } => {
                if !is_active(xid_store, *xid)? {
                    let (pgno, offset) = unpack_uid(*uid);
                    redo_update(cache, pgno, offset, new)?;
                }
            }
        }
    }

    // Pass 3: UNDO every record whose xid is still active, newest first.
    let mut active_xids: HashSet<u64> = HashSet::new();
    for record in records.iter().rev() {
        let xid = record.payload.xid();
        if !is_active(xid_store, xid)? {
            continue;
        }
        active_xids.insert(xid);
        match &record.payload {
            LogPayload::Insert { pgno, offset, .. } => {
                undo_insert(cache, *pgno as u64, *offset)?;
            }
            LogPayload::Update { uid, old, .. } => {
                let (pgno, offset) = unpack_uid(*uid);
                undo_update(cache, pgno, offset, old)?;
            }
        }
    }
    for xid in active_xids {
        xid_store.abort(xid)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_item::DataManager;
    use crate::fsm::FreeSpaceMap;
    use crate::wal::Wal;

    #[test]
    fn redo_committed_undo_active() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        let log_path = dir.path().join("t.log");
        let xid_path = dir.path().join("t.xid");

        let cache = PageCache::open(&db_path, 64).unwrap();
        let (wal, _) = Wal::open(&log_path, 1 << 16).unwrap();
        let xid_store = XidStore::create(&xid_path).unwrap();
        let dm = DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new()));

        let committed_xid = xid_store.begin().unwrap();
        let committed_uid = dm.insert(committed_xid, b"committed-row").unwrap();
        xid_store.commit(committed_xid).unwrap();

        let active_xid = xid_store.begin().unwrap();
        let active_uid = dm.insert(active_xid, b"uncommitted-row").unwrap();
        // Simulate a crash: xid stays "active", nothing flushed beyond this.
        dm.wal().flush(dm.wal().current_lsn()).unwrap();

        // Reopen everything fresh, as a post-crash restart would.
        drop(dm);
        let cache2 = PageCache::open(&db_path, 64).unwrap();
        let (_wal2, records) = Wal::open(&log_path, 1 << 16).unwrap();
        let xid_store2 = XidStore::open(&xid_path).unwrap();

        recover(&cache2, &xid_store2, &records).unwrap();

        let dm2 = DataManager::new(
            cache2,
            Wal::open(dir.path().join("t2.log"), 1 << 16).unwrap().0,
            Arc::new(FreeSpaceMap::new()),
        );
        assert_eq!(
            dm2.read(committed_uid).unwrap().unwrap().raw,
            b"committed-row"
        );
        assert!(dm2.read(active_uid).unwrap().is_none());
        assert!(xid_store2.is_aborted(active_xid).unwrap());
    }
}
