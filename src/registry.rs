//! Database Registry: named database directories, refcounted lifecycle. (C11)
//!
//! Each database lives in its own subdirectory under the registry root,
//! holding `<name>.db`, `<name>.log`, `<name>.xid`, and `<name>.bt`. `create`
//! bootstraps a fresh stack just to prove it can, then closes it; `acquire`
//! opens (or reuses) the stack and bumps a refcount, running crash recovery
//! first if the directory already existed; `release` drops the refcount and
//! tears the stack down once nothing holds it; `drop_database` refuses while
//! any handle is outstanding.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::catalog::{Catalog, UniqueGuard};
use crate::config::Config;
use crate::data_item::DataManager;
use crate::error::{DbError, Result};
use crate::fsm::FreeSpaceMap;
use crate::lock_manager::LockManager;
use crate::mvcc::MvccEngine;
use crate::page_cache::PageCache;
use crate::recovery;
use crate::wal::Wal;
use crate::xid::XidStore;

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// One database's fully-wired storage stack.
pub struct Database {
    pub name: String,
    pub catalog: Arc<Catalog>,
    pub mvcc: Arc<MvccEngine>,
    pub unique_guard: Arc<UniqueGuard>,
}

impl Database {
    fn close(&self) -> Result<()> {
        self.mvcc.data_manager().close()
    }
}

struct Entry {
    db: Arc<Database>,
    refcount: usize,
}

pub struct Registry {
    root: PathBuf,
    config: Config,
    open: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            root: config.data_dir.clone(),
            config,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn dir_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Wire up (or reopen) `name`'s C2/C3/C4/C10 stack at `dir`, running
    /// recovery when the xid file already exists from a previous run.
    fn bootstrap(&self, name: &str, dir: &Path) -> Result<Arc<Database>> {
        fs::create_dir_all(dir)?;
        let db_path = dir.join(format!("{name}.db"));
        let log_path = dir.join(format!("{name}.log"));
        let xid_path = dir.join(format!("{name}.xid"));
        let bt_path = dir.join(format!("{name}.bt"));
        let existed = xid_path.exists();

        let cache = PageCache::open(&db_path, self.config.cache_capacity)?;
        let (wal, records) = Wal::open(&log_path, self.config.wal_buffer_size)?;
        let xid_store = Arc::new(if existed {
            XidStore::open(&xid_path)?
        } else {
            XidStore::create(&xid_path)?
        });

        if existed {
            recovery::recover(&cache, &xid_store, &records)?;
        }

        let data = Arc::new(DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new())));
        let locks = Arc::new(LockManager::new());
        let mvcc = Arc::new(MvccEngine::new(xid_store, data, locks));
        let catalog = Arc::new(Catalog::open(&bt_path, Arc::clone(&mvcc))?);
        let unique_guard = Arc::new(UniqueGuard::new());

        Ok(Arc::new(Database {
            name: name.to_string(),
            catalog,
            mvcc,
            unique_guard,
        }))
    }

    /// Create a new named database: bootstraps a fresh stack to prove the
    /// directory is usable, then closes it. `acquire` opens it for real.
    pub fn create(&self, name: &str) -> Result<()> {
        if !valid_name(name) {
            return Err(DbError::InvalidCommand(format!(
                "invalid database name: {name}"
            )));
        }
        let dir = self.dir_for(name);
        if dir.exists() {
            return Err(DbError::DatabaseExists(name.to_string()));
        }
        let db = self.bootstrap(name, &dir)?;
        db.close()
    }

    /// Open (or reuse) `name`'s stack, bumping its refcount.
    pub fn acquire(&self, name: &str) -> Result<Arc<Database>> {
        let dir = self.dir_for(name);
        if !dir.exists() {
            return Err(DbError::DatabaseNotFound(name.to_string()));
        }
        let mut open = self.open.lock().unwrap();
        if let Some(entry) = open.get_mut(name) {
            entry.refcount += 1;
            return Ok(Arc::clone(&entry.db));
        }
        let db = self.bootstrap(name, &dir)?;
        open.insert(
            name.to_string(),
            Entry {
                db: Arc::clone(&db),
                refcount: 1,
            },
        );
        Ok(db)
    }

    /// Drop `name`'s refcount by one, closing its stack once nothing else
    /// holds it.
    pub fn release(&self, name: &str) {
        let mut open = self.open.lock().unwrap();
        if let Some(entry) = open.get_mut(name) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                let entry = open.remove(name).unwrap();
                let _ = entry.db.close();
            }
        }
    }

    /// Delete a database's directory. Refuses while any handle is
    /// outstanding.
    pub fn drop_database(&self, name: &str) -> Result<()> {
        let dir = self.dir_for(name);
        if !dir.exists() {
            return Err(DbError::DatabaseNotFound(name.to_string()));
        }
        let open = self.open.lock().unwrap();
        if open.contains_key(name) {
            return Err(DbError::DatabaseInUse(name.to_string()));
        }
        drop(open);
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// List databases with a matching `.xid` file, sorted lexicographically.
    pub fn show(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if self.root.exists() {
            for entry in fs::read_dir(&self.root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if entry.path().join(format!("{name}.xid")).exists() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            cache_capacity: 64,
            wal_buffer_size: 1 << 16,
            ..Config::default()
        };
        let registry = Registry::new(config).unwrap();
        (dir, registry)
    }

    #[test]
    fn create_then_acquire_round_trips() {
        let (_dir, registry) = registry();
        registry.create("shop").unwrap();
        let db = registry.acquire("shop").unwrap();
        assert_eq!(db.name, "shop");
        registry.release("shop");
    }

    #[test]
    fn duplicate_create_rejected() {
        let (_dir, registry) = registry();
        registry.create("shop").unwrap();
        assert!(matches!(
            registry.create("shop").unwrap_err(),
            DbError::DatabaseExists(_)
        ));
    }

    #[test]
    fn invalid_name_rejected() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.create("shop name").unwrap_err(),
            DbError::InvalidCommand(_)
        ));
    }

    #[test]
    fn drop_while_acquired_refused() {
        let (_dir, registry) = registry();
        registry.create("shop").unwrap();
        let _db = registry.acquire("shop").unwrap();
        assert!(matches!(
            registry.drop_database("shop").unwrap_err(),
            DbError::DatabaseInUse(_)
        ));
        registry.release("shop");
        registry.drop_database("shop").unwrap();
    }

    #[test]
    fn show_lists_sorted_names() {
        let (_dir, registry) = registry();
        registry.create("zeta").unwrap();
        registry.create("alpha").unwrap();
        assert_eq!(registry.show().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn acquire_shares_stack_across_refcount() {
        let (_dir, registry) = registry();
        registry.create("shop").unwrap();
        let a = registry.acquire("shop").unwrap();
        let b = registry.acquire("shop").unwrap();
        assert!(Arc::ptr_eq(&a.mvcc, &b.mvcc));
        registry.release("shop");
        registry.release("shop");
    }

    #[test]
    fn reacquire_after_release_survives_restart() {
        let (_dir, registry) = registry();
        registry.create("shop").unwrap();
        let db = registry.acquire("shop").unwrap();
        db.catalog
            .create_table("t", vec![crate::types::Field {
                name: "id".to_string(),
                ty: crate::types::DataType::Int64,
                index_uid: None,
                unique: false,
                primary: true,
            }])
            .unwrap();
        registry.release("shop");

        let db2 = registry.acquire("shop").unwrap();
        assert!(db2.catalog.get("t").is_some());
        registry.release("shop");
    }
}
