//! Transaction ID store: persists per-XID status in a flat file. (C3)
//!
//! Layout: `[counter:u64][status byte per xid]`. XID 0 is the super
//! transaction and is never stored; xid 1 lives at byte offset 8.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::RwLock;

use crate::error::{DbError, Result};

const HEADER_LEN: u64 = 8;
const STATUS_ACTIVE: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

/// The synthetic transaction id used for catalog/index metadata; always
/// committed and bypasses visibility and locking.
pub const SUPER_XID: u64 = 0;

#[derive(Debug)]
struct Inner {
    file: File,
    counter: u64,
}

#[derive(Debug)]
pub struct XidStore {
    inner: RwLock<Inner>,
}

impl XidStore {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(DbError::FileExists(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.write_all(&0u64.to_be_bytes())?;
        file.sync_all()?;
        Ok(Self {
            inner: RwLock::new(Inner { file, counter: 0 }),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| DbError::FileNotExists(path.display().to_string()))?;
        let len = file.metadata()?.len();
        if len < HEADER_LEN {
            return Err(DbError::BadXidFile(format!(
                "{}: file shorter than header",
                path.display()
            )));
        }
        let mut hdr = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut hdr)?;
        let counter = u64::from_be_bytes(hdr);
        if len != HEADER_LEN + counter {
            return Err(DbError::BadXidFile(format!(
                "{}: expected length {}, found {}",
                path.display(),
                HEADER_LEN + counter,
                len
            )));
        }
        Ok(Self {
            inner: RwLock::new(Inner { file, counter }),
        })
    }

    fn status_offset(xid: u64) -> u64 {
        HEADER_LEN + (xid - 1)
    }

    /// Allocate the next xid, write its status as active, and durably bump
    /// the counter.
    pub fn begin(&self) -> Result<u64> {
        let mut inner = self.inner.write().unwrap();
        let xid = inner.counter + 1;
        let offset = Self::status_offset(xid);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[STATUS_ACTIVE])?;
        inner.counter = xid;
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&xid.to_be_bytes())?;
        inner.file.sync_all()?;
        Ok(xid)
    }

    fn set_status(&self, xid: u64, status: u8) -> Result<()> {
        if xid == SUPER_XID {
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();
        let offset = Self::status_offset(xid);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&[status])?;
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn commit(&self, xid: u64) -> Result<()> {
        self.set_status(xid, STATUS_COMMITTED)
    }

    pub fn abort(&self, xid: u64) -> Result<()> {
        self.set_status(xid, STATUS_ABORTED)
    }

    fn read_status(&self, xid: u64) -> Result<u8> {
        if xid == SUPER_XID {
            return Ok(STATUS_COMMITTED);
        }
        let inner = self.inner.read().unwrap();
        if xid > inner.counter {
            return Ok(STATUS_ACTIVE);
        }
        let mut file = inner.file.try_clone()?;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(Self::status_offset(xid)))?;
        file.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn is_active(&self, xid: u64) -> Result<bool> {
        Ok(self.read_status(xid)? == STATUS_ACTIVE)
    }

    pub fn is_committed(&self, xid: u64) -> Result<bool> {
        Ok(self.read_status(xid)? == STATUS_COMMITTED)
    }

    pub fn is_aborted(&self, xid: u64) -> Result<bool> {
        Ok(self.read_status(xid)? == STATUS_ABORTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_abort_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.xid");
        let store = XidStore::create(&path).unwrap();
        let x1 = store.begin().unwrap();
        let x2 = store.begin().unwrap();
        assert_eq!(x1, 1);
        assert_eq!(x2, 2);
        assert!(store.is_active(x1).unwrap());
        store.commit(x1).unwrap();
        store.abort(x2).unwrap();
        assert!(store.is_committed(x1).unwrap());
        assert!(store.is_aborted(x2).unwrap());

        drop(store);
        let reopened = XidStore::open(&path).unwrap();
        assert!(reopened.is_committed(x1).unwrap());
        assert!(reopened.is_aborted(x2).unwrap());
    }

    #[test]
    fn super_xid_always_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = XidStore::create(dir.path().join("t.xid")).unwrap();
        assert!(store.is_committed(SUPER_XID).unwrap());
    }

    #[test]
    fn bad_length_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.xid");
        std::fs::write(&path, [0u8; 3]).unwrap();
        assert!(matches!(
            XidStore::open(&path).unwrap_err(),
            DbError::BadXidFile(_)
        ));
    }
}
