//! Reference-counted LRU page cache over one heap file per database. (C1)
//!
//! A handle returned by [`PageCache::get_page`] pins the page until
//! [`PageCache::release`] (or the handle's `Drop`) brings its refcount back
//! to zero; only unpinned pages are eligible for eviction. Concurrent
//! `get_page` calls on the same unresident key load the page exactly once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};

use crate::config::PAGE_SIZE;
use crate::error::{DbError, Result};

#[derive(Debug)]
pub struct Page {
    pub pgno: u64,
    pub data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
    refcount: AtomicUsize,
}

impl Page {
    fn new(pgno: u64, data: Vec<u8>) -> Self {
        Self {
            pgno,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, AtomicOrdering::SeqCst);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(AtomicOrdering::SeqCst)
    }

    fn pinned(&self) -> bool {
        self.refcount.load(AtomicOrdering::SeqCst) > 0
    }
}

/// A pinned reference to a page; drop or [`PageCache::release`] unpins it.
#[derive(Debug)]
pub struct PageHandle {
    pub page: Arc<Page>,
    cache: Arc<PageCache>,
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.cache.unpin(&self.page);
    }
}

#[derive(Debug)]
struct State {
    pages: HashMap<u64, Arc<Page>>,
    lru: VecDeque<u64>,
    loading: HashSet<u64>,
    page_count: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct PageCache {
    file: Mutex<File>,
    capacity: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl PageCache {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Arc<Self>> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|_| DbError::FileCannotRW(path.display().to_string()))?;
        let len = file.metadata()?.len();
        let page_count = len / PAGE_SIZE as u64;
        Ok(Arc::new(Self {
            file: Mutex::new(file),
            capacity,
            state: Mutex::new(State {
                pages: HashMap::new(),
                lru: VecDeque::new(),
                loading: HashSet::new(),
                page_count,
                closed: false,
            }),
            cond: Condvar::new(),
        }))
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().unwrap().page_count
    }

    /// Append a new page initialized from `init_bytes` (padded/truncated to
    /// PAGE_SIZE) and return its 1-based page number.
    pub fn new_page(self: &Arc<Self>, init_bytes: &[u8]) -> Result<u64> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let n = init_bytes.len().min(PAGE_SIZE);
        buf[..n].copy_from_slice(&init_bytes[..n]);

        let pgno = {
            let mut st = self.state.lock().unwrap();
            st.page_count += 1;
            st.page_count
        };
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start((pgno - 1) * PAGE_SIZE as u64))?;
            file.write_all(&buf)?;
        }
        let page = Arc::new(Page::new(pgno, buf));
        let mut st = self.state.lock().unwrap();
        st.pages.insert(pgno, page);
        st.lru.push_back(pgno);
        Ok(pgno)
    }

    /// Pin and return the page, loading it from disk on a cache miss.
    pub fn get_page(self: &Arc<Self>, pgno: u64) -> Result<PageHandle> {
        loop {
            let mut st = self.state.lock().unwrap();
            if let Some(page) = st.pages.get(&pgno).cloned() {
                page.refcount.fetch_add(1, AtomicOrdering::SeqCst);
                st.lru.retain(|p| *p != pgno);
                st.lru.push_back(pgno);
                return Ok(PageHandle {
                    page,
                    cache: Arc::clone(self),
                });
            }
            if st.loading.contains(&pgno) {
                // Someone else is loading this page; wait for it.
                st = self.cond.wait(st).unwrap();
                drop(st);
                continue;
            }
            // Single-flight: claim the load before releasing the lock.
            if st.pages.len() >= self.capacity {
                match self.evict_one(&mut st) {
                    Ok(()) => {}
                    Err(DbError::CacheFull) => return Err(DbError::CacheFull),
                    Err(e) => return Err(e),
                }
            }
            st.loading.insert(pgno);
            drop(st);

            let data = self.read_page_from_disk(pgno);
            let mut st = self.state.lock().unwrap();
            st.loading.remove(&pgno);
            self.cond.notify_all();
            let data = data?;
            let page = Arc::new(Page::new(pgno, data));
            page.refcount.fetch_add(1, AtomicOrdering::SeqCst);
            st.pages.insert(pgno, Arc::clone(&page));
            st.lru.push_back(pgno);
            return Ok(PageHandle {
                page,
                cache: Arc::clone(self),
            });
        }
    }

    fn read_page_from_disk(&self, pgno: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((pgno - 1) * PAGE_SIZE as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Evict the least-recently-used unpinned page, flushing it if dirty.
    /// Caller holds `state`'s lock.
    fn evict_one(&self, st: &mut State) -> Result<()> {
        let victim_idx = st
            .lru
            .iter()
            .position(|pgno| !st.pages.get(pgno).map(|p| p.pinned()).unwrap_or(true));
        let idx = match victim_idx {
            Some(i) => i,
            None => return Err(DbError::CacheFull),
        };
        let pgno = st.lru.remove(idx).unwrap();
        if let Some(page) = st.pages.remove(&pgno) {
            if page.is_dirty() {
                self.write_page_to_disk(&page)?;
            }
        }
        Ok(())
    }

    fn write_page_to_disk(&self, page: &Page) -> Result<()> {
        let data = page.data.lock().unwrap();
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((page.pgno - 1) * PAGE_SIZE as u64))?;
        file.write_all(&data)?;
        page.dirty.store(false, AtomicOrdering::SeqCst);
        Ok(())
    }

    pub fn flush_page(&self, page: &Arc<Page>) -> Result<()> {
        if page.is_dirty() {
            self.write_page_to_disk(page)?;
        }
        Ok(())
    }

    pub fn release(&self, handle: PageHandle) {
        drop(handle);
    }

    fn unpin(&self, page: &Arc<Page>) {
        page.refcount.fetch_sub(1, AtomicOrdering::SeqCst);
        self.cond.notify_all();
    }

    /// Truncate the heap file to `pgno` pages. Legal only when the caller
    /// can prove no handle above the cut is pinned; debug builds assert it.
    pub fn truncate_to(&self, pgno: u64) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        #[cfg(debug_assertions)]
        {
            for (&p, page) in st.pages.iter() {
                if p > pgno && page.pinned() {
                    panic!("truncate_to({}): page {} is still pinned", pgno, p);
                }
            }
        }
        st.pages.retain(|&p, _| p <= pgno);
        st.lru.retain(|&p| p <= pgno);
        st.page_count = pgno;
        let mut file = self.file.lock().unwrap();
        file.set_len(pgno * PAGE_SIZE as u64)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let dirty: Vec<Arc<Page>> = st
            .pages
            .values()
            .filter(|p| p.is_dirty())
            .cloned()
            .collect();
        for page in dirty {
            self.write_page_to_disk(&page)?;
        }
        st.closed = true;
        self.cond.notify_all();
        Ok(())
    }
}
