//! Engine-wide tunables.
//!
//! Mirrors the source's scattered constants (`PAGE_SIZE`, `BALANCE_NUMBER`,
//! ring buffer size, lock wait timeout) as one struct so tests can shrink
//! them without touching production defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default page size: 8 KiB.
pub const PAGE_SIZE: usize = 8192;

/// Split threshold for the B+ tree is `2 * BALANCE_NUMBER` keys.
pub const BALANCE_NUMBER: usize = 16;

/// Number of free-space map buckets.
pub const FSM_BUCKETS: usize = 40;

/// Lock manager wait timeout (spec's "newer lineage").
pub const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Config {
    /// Address the line protocol listener binds to.
    pub bind_addr: SocketAddr,
    /// Root directory under which the database registry creates subdirectories.
    pub data_dir: PathBuf,
    /// Page cache capacity, in pages, per opened database.
    pub cache_capacity: usize,
    /// WAL ring buffer size in bytes.
    pub wal_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9999".parse().expect("invalid default bind address"),
            data_dir: PathBuf::from("./data"),
            cache_capacity: 4096,
            wal_buffer_size: 1 << 20,
        }
    }
}
