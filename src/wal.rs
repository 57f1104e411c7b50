//! Write-ahead log: append/write/flush pipeline with crash recovery. (C2)
//!
//! Three roles share one ring buffer and a handful of condition-variable
//! predicates, in the same deferred-fsync-with-latches shape as the
//! engine's original commit-latch design: a producer (`append`) reserves
//! space and copies bytes in; a background writer thread drains the ring
//! buffer into the file; a background flusher thread fsyncs and rewrites
//! the header, waking everyone blocked in `flush`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::{DbError, Result};

const MAGIC: u32 = 0x4D53_5157; // "MSQW"
const VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
const RECORD_HEADER_LEN: u64 = 16;
const STAGING_SIZE: usize = 8192;

const OP_INSERT: u8 = 0x00;
const OP_UPDATE: u8 = 0x01;

#[derive(Debug, Clone)]
pub enum LogPayload {
    Insert {
        xid: u64,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: u64,
        uid: u64,
        old: Vec<u8>,
        new: Vec<u8>,
    },
}

impl LogPayload {
    pub fn xid(&self) -> u64 {
        match self {
            LogPayload::Insert { xid, .. } => *xid,
            LogPayload::Update { xid, .. } => *xid,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            LogPayload::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                let mut buf = vec![OP_INSERT];
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&pgno.to_be_bytes());
                buf.extend_from_slice(&offset.to_be_bytes());
                buf.extend_from_slice(raw);
                buf
            }
            LogPayload::Update { xid, uid, old, new } => {
                let mut buf = vec![OP_UPDATE];
                buf.extend_from_slice(&xid.to_be_bytes());
                buf.extend_from_slice(&uid.to_be_bytes());
                buf.extend_from_slice(old);
                buf.extend_from_slice(new);
                buf
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(DbError::InvalidLogOp);
        }
        match buf[0] {
            OP_INSERT => {
                if buf.len() < 1 + 8 + 4 + 2 {
                    return Err(DbError::InvalidLogOp);
                }
                let xid = u64::from_be_bytes(buf[1..9].try_into().unwrap());
                let pgno = u32::from_be_bytes(buf[9..13].try_into().unwrap());
                let offset = u16::from_be_bytes(buf[13..15].try_into().unwrap());
                let raw = buf[15..].to_vec();
                Ok(LogPayload::Insert {
                    xid,
                    pgno,
                    offset,
                    raw,
                })
            }
            OP_UPDATE => {
                if buf.len() < 1 + 8 + 8 {
                    return Err(DbError::InvalidLogOp);
                }
                let xid = u64::from_be_bytes(buf[1..9].try_into().unwrap());
                let uid = u64::from_be_bytes(buf[9..17].try_into().unwrap());
                let rest = &buf[17..];
                if rest.len() % 2 != 0 {
                    return Err(DbError::InvalidLogOp);
                }
                let half = rest.len() / 2;
                Ok(LogPayload::Update {
                    xid,
                    uid,
                    old: rest[..half].to_vec(),
                    new: rest[half..].to_vec(),
                })
            }
            _ => Err(DbError::InvalidLogOp),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub end_lsn: u64,
    pub payload: LogPayload,
}

struct Ring {
    buf: Vec<u8>,
    capacity: u64,
    current_lsn: u64,
    written_lsn: u64,
    flushed_lsn: u64,
    checkpoint_lsn: u64,
    flush_target: u64,
    shutdown: bool,
}

impl Ring {
    fn put(&mut self, bytes: &[u8], at: u64) {
        let cap = self.capacity as usize;
        let start = (at % self.capacity) as usize;
        let first = (cap - start).min(bytes.len());
        self.buf[start..start + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
    }

    fn take(&self, at: u64, len: usize) -> Vec<u8> {
        let cap = self.capacity as usize;
        let start = (at % self.capacity) as usize;
        let first = (cap - start).min(len);
        let mut out = vec![0u8; len];
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        if first < len {
            out[first..].copy_from_slice(&self.buf[..len - first]);
        }
        out
    }
}

pub struct Wal {
    path: PathBuf,
    file: Mutex<File>,
    ring: Mutex<Ring>,
    cond: Condvar,
    writer: Mutex<Option<JoinHandle<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn header_crc(checkpoint_lsn: u64, flushed_lsn: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&checkpoint_lsn.to_be_bytes());
    hasher.update(&flushed_lsn.to_be_bytes());
    hasher.finalize()
}

fn write_header(file: &mut File, checkpoint_lsn: u64, flushed_lsn: u64) -> Result<()> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&VERSION.to_be_bytes());
    buf[8..12].copy_from_slice(&header_crc(checkpoint_lsn, flushed_lsn).to_be_bytes());
    buf[12..20].copy_from_slice(&checkpoint_lsn.to_be_bytes());
    buf[20..28].copy_from_slice(&flushed_lsn.to_be_bytes());
    // bytes 28..32 stay reserved/zero.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

impl Wal {
    pub fn open(path: impl AsRef<Path>, ring_capacity: usize) -> Result<(Arc<Self>, Vec<LogRecord>)> {
        let path = path.as_ref().to_path_buf();
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let (checkpoint_lsn, flushed_lsn, records) = if fresh {
            write_header(&mut file, 0, 0)?;
            (0u64, 0u64, Vec::new())
        } else {
            let mut hdr = [0u8; HEADER_LEN as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut hdr).map_err(|_| {
                DbError::BadLogFile(format!("{}: truncated header", path.display()))
            })?;
            let magic = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
            let version = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
            let hdr_crc = u32::from_be_bytes(hdr[8..12].try_into().unwrap());
            let checkpoint_lsn = u64::from_be_bytes(hdr[12..20].try_into().unwrap());
            let flushed_lsn = u64::from_be_bytes(hdr[20..28].try_into().unwrap());
            if magic != MAGIC || version != VERSION {
                return Err(DbError::BadLogFile(format!(
                    "{}: bad magic/version",
                    path.display()
                )));
            }
            if header_crc(checkpoint_lsn, flushed_lsn) != hdr_crc {
                return Err(DbError::BadLogFile(format!(
                    "{}: header CRC mismatch",
                    path.display()
                )));
            }

            let mut body = Vec::new();
            file.seek(SeekFrom::Start(HEADER_LEN))?;
            file.read_to_end(&mut body)?;

            let mut records = Vec::new();
            let mut pos: usize = 0;
            let mut good_len: u64 = 0;
            while pos + RECORD_HEADER_LEN as usize <= body.len() {
                let payload_len = u32::from_be_bytes(body[pos..pos + 4].try_into().unwrap()) as usize;
                let record_crc = u32::from_be_bytes(body[pos + 4..pos + 8].try_into().unwrap());
                let end_lsn = u64::from_be_bytes(body[pos + 8..pos + 16].try_into().unwrap());
                let payload_start = pos + RECORD_HEADER_LEN as usize;
                let payload_end = payload_start + payload_len;
                if payload_end > body.len() {
                    break;
                }
                let payload_bytes = &body[payload_start..payload_end];
                let expected_end_lsn = (pos as u64) + RECORD_HEADER_LEN + payload_len as u64;
                if end_lsn != expected_end_lsn {
                    break;
                }
                if crc32fast::hash(payload_bytes) != record_crc {
                    break;
                }
                let payload = match LogPayload::decode(payload_bytes) {
                    Ok(p) => p,
                    Err(_) => break,
                };
                records.push(LogRecord { end_lsn, payload });
                good_len = end_lsn;
                pos = payload_end;
            }

            file.set_len(HEADER_LEN + good_len)?;
            let flushed_lsn = flushed_lsn.min(good_len);
            let checkpoint_lsn = checkpoint_lsn.min(flushed_lsn);
            write_header(&mut file, checkpoint_lsn, flushed_lsn)?;
            (checkpoint_lsn, flushed_lsn, records)
        };

        let good_len = records.last().map(|r| r.end_lsn).unwrap_or(0).max(flushed_lsn);

        let wal = Arc::new(Self {
            path: path.clone(),
            file: Mutex::new(file.try_clone()?),
            ring: Mutex::new(Ring {
                buf: vec![0u8; ring_capacity],
                capacity: ring_capacity as u64,
                current_lsn: good_len,
                written_lsn: good_len,
                flushed_lsn,
                checkpoint_lsn,
                flush_target: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
            writer: Mutex::new(None),
            flusher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        wal.spawn_workers();
        Ok((wal, records))
    }

    fn spawn_workers(self: &Arc<Self>) {
        let writer_wal = Arc::clone(self);
        let writer_handle = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || writer_wal.writer_loop())
            .expect("spawn wal writer thread");
        *self.writer.lock().unwrap() = Some(writer_handle);

        let flusher_wal = Arc::clone(self);
        let flusher_handle = std::thread::Builder::new()
            .name("wal-flusher".into())
            .spawn(move || flusher_wal.flusher_loop())
            .expect("spawn wal flusher thread");
        *self.flusher.lock().unwrap() = Some(flusher_handle);
    }

    /// Reserve space for `payload`, copy it into the ring buffer, and return
    /// its end LSN. Blocks until the writer has drained enough space.
    pub fn append(&self, payload: &LogPayload) -> Result<u64> {
        let body = payload.encode();
        let record_size = RECORD_HEADER_LEN + body.len() as u64;

        let mut ring = self.ring.lock().unwrap();
        if record_size > ring.capacity {
            return Err(DbError::RecordTooLarge);
        }
        loop {
            let in_flight = ring.current_lsn - ring.written_lsn;
            if ring.capacity - in_flight >= record_size {
                break;
            }
            ring = self.cond.wait(ring).unwrap();
        }

        let start_lsn = ring.current_lsn;
        let end_lsn = start_lsn + record_size;
        let crc = crc32fast::hash(&body);

        let mut record = Vec::with_capacity(record_size as usize);
        record.extend_from_slice(&(body.len() as u32).to_be_bytes());
        record.extend_from_slice(&crc.to_be_bytes());
        record.extend_from_slice(&end_lsn.to_be_bytes());
        record.extend_from_slice(&body);

        ring.put(&record, start_lsn);
        ring.current_lsn = end_lsn;
        self.cond.notify_all();
        Ok(end_lsn)
    }

    fn writer_loop(self: Arc<Self>) {
        loop {
            let (start, bytes) = {
                let mut ring = self.ring.lock().unwrap();
                loop {
                    if ring.current_lsn > ring.written_lsn {
                        break;
                    }
                    if ring.shutdown {
                        return;
                    }
                    ring = self.cond.wait(ring).unwrap();
                }
                let n = ((ring.current_lsn - ring.written_lsn) as usize).min(STAGING_SIZE);
                let start = ring.written_lsn;
                (start, ring.take(start, n))
            };
            {
                let mut file = self.file.lock().unwrap();
                if file.seek(SeekFrom::Start(HEADER_LEN + start)).is_err() {
                    continue;
                }
                if file.write_all(&bytes).is_err() {
                    continue;
                }
            }
            let mut ring = self.ring.lock().unwrap();
            ring.written_lsn = start + bytes.len() as u64;
            self.cond.notify_all();
        }
    }

    fn flusher_loop(self: Arc<Self>) {
        loop {
            let target = {
                let mut ring = self.ring.lock().unwrap();
                loop {
                    let want = ring.flush_target;
                    if want > ring.flushed_lsn && ring.written_lsn >= want {
                        break want;
                    }
                    if ring.shutdown {
                        return;
                    }
                    ring = self.cond.wait(ring).unwrap();
                }
            };
            let checkpoint_lsn = self.ring.lock().unwrap().checkpoint_lsn;
            {
                let mut file = self.file.lock().unwrap();
                if write_header(&mut file, checkpoint_lsn, target).is_err() {
                    continue;
                }
            }
            let mut ring = self.ring.lock().unwrap();
            ring.flushed_lsn = target;
            self.cond.notify_all();
        }
    }

    /// Block until `flushed_lsn >= lsn`.
    pub fn flush(&self, lsn: u64) -> Result<()> {
        let mut ring = self.ring.lock().unwrap();
        if ring.flush_target < lsn {
            ring.flush_target = lsn;
        }
        self.cond.notify_all();
        while ring.flushed_lsn < lsn && !ring.shutdown {
            ring = self.cond.wait(ring).unwrap();
        }
        Ok(())
    }

    pub fn set_checkpoint(&self, lsn: u64) {
        let mut ring = self.ring.lock().unwrap();
        ring.checkpoint_lsn = lsn;
    }

    pub fn get_flushed_lsn(&self) -> u64 {
        self.ring.lock().unwrap().flushed_lsn
    }

    pub fn current_lsn(&self) -> u64 {
        self.ring.lock().unwrap().current_lsn
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        {
            let mut ring = self.ring.lock().unwrap();
            ring.shutdown = true;
        }
        self.cond.notify_all();
        if let Some(h) = self.writer.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.flusher.lock().unwrap().take() {
            let _ = h.join();
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(xid: u64, pgno: u32, raw: &[u8]) -> LogPayload {
        LogPayload::Insert {
            xid,
            pgno,
            offset: 0,
            raw: raw.to_vec(),
        }
    }

    #[test]
    fn append_flush_reopen_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let (wal, records) = Wal::open(&path, 1 << 16).unwrap();
        assert!(records.is_empty());
        let lsn1 = wal.append(&insert(1, 1, b"hello")).unwrap();
        let lsn2 = wal.append(&insert(1, 1, b"world")).unwrap();
        wal.flush(lsn2).unwrap();
        assert!(wal.get_flushed_lsn() >= lsn2);
        wal.close().unwrap();

        let (_wal2, records) = Wal::open(&path, 1 << 16).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].end_lsn, lsn1);
        assert_eq!(records[1].end_lsn, lsn2);
    }

    #[test]
    fn corrupted_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.log");
        let (wal, _) = Wal::open(&path, 1 << 16).unwrap();
        let lsn1 = wal.append(&insert(1, 1, b"good")).unwrap();
        wal.flush(lsn1).unwrap();
        wal.append(&insert(1, 1, b"corrupt-me")).unwrap();
        wal.flush(wal.current_lsn()).unwrap();
        wal.close().unwrap();

        // Flip a bit in the last record's payload.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let (wal2, records) = Wal::open(&path, 1 << 16).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(wal2.get_flushed_lsn(), lsn1);
    }

    #[test]
    fn oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (wal, _) = Wal::open(dir.path().join("t.log"), 32).unwrap();
        let big = insert(1, 1, &vec![0u8; 1024]);
        assert!(matches!(wal.append(&big), Err(DbError::RecordTooLarge)));
    }
}
