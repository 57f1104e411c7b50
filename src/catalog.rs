//! Catalog: the singly-linked list of table definitions anchored in a
//! booter file, plus the in-memory table cache DDL/DML contend over. (C10a)
//!
//! Each table's catalog entry is an MVCC item under the super transaction:
//! `[next_uid:u64][json body]`. Only the 8-byte link is ever mutated after
//! creation (an equal-length overwrite), so unlinking a dropped table never
//! touches the JSON body. The booter file holds the uid of the list head
//! and is updated by write-tmp-then-rename.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::btree::BTree;
use crate::error::{DbError, Result};
use crate::mvcc::MvccEngine;
use crate::types::{DataType, Field};
use crate::xid::SUPER_XID;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableMeta {
    name: String,
    fields: Vec<Field>,
}

fn encode_entry(next_uid: u64, meta: &TableMeta) -> Result<Vec<u8>> {
    let mut buf = next_uid.to_be_bytes().to_vec();
    buf.extend(serde_json::to_vec(meta)?);
    Ok(buf)
}

fn decode_entry(raw: &[u8]) -> Result<(u64, TableMeta)> {
    if raw.len() < 8 {
        return Err(DbError::Internal("corrupt catalog entry".into()));
    }
    let next_uid = u64::from_be_bytes(raw[0..8].try_into().unwrap());
    let meta: TableMeta = serde_json::from_slice(&raw[8..])?;
    Ok((next_uid, meta))
}

/// A table's schema plus the live B+ tree index for each indexed field.
pub struct Table {
    pub uid: u64,
    pub name: String,
    pub fields: Vec<Field>,
    pub indexes: HashMap<String, BTree>,
}

impl Table {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn primary_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.primary)
    }
}

fn read_booter(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let bytes = fs::read(path)?;
    if bytes.len() != 8 {
        return Err(DbError::Internal(format!(
            "{}: booter file must be 8 bytes",
            path.display()
        )));
    }
    Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
}

fn write_booter(path: &Path, head: u64) -> Result<()> {
    let tmp = path.with_extension("bt.tmp");
    fs::write(&tmp, head.to_be_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct Catalog {
    booter_path: PathBuf,
    mvcc: Arc<MvccEngine>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Catalog {
    /// Load (or initialize) the catalog, walking the on-disk chain into an
    /// in-memory table cache.
    pub fn open(booter_path: impl AsRef<Path>, mvcc: Arc<MvccEngine>) -> Result<Self> {
        let booter_path = booter_path.as_ref().to_path_buf();
        let mut tables = HashMap::new();
        let mut uid = read_booter(&booter_path)?;
        while uid != 0 {
            let raw = mvcc
                .read(SUPER_XID, uid)?
                .ok_or_else(|| DbError::Internal("catalog: dangling entry uid".into()))?;
            let (next_uid, meta) = decode_entry(&raw)?;
            let mut indexes = HashMap::new();
            for field in &meta.fields {
                if let Some(index_uid) = field.index_uid {
                    indexes.insert(field.name.clone(), BTree::open(Arc::clone(&mvcc), index_uid));
                }
            }
            tables.insert(
                meta.name.clone(),
                Arc::new(Table {
                    uid,
                    name: meta.name,
                    fields: meta.fields,
                    indexes,
                }),
            );
            uid = next_uid;
        }
        Ok(Self {
            booter_path,
            mvcc,
            tables: RwLock::new(tables),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().unwrap().get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// Define a new table: every field named `unique: true` or `primary:
    /// true` gets its own B+ tree index (primary keys are implicitly
    /// unique). Errors with `DuplicatedTable` if the name is taken.
    pub fn create_table(&self, name: &str, mut fields: Vec<Field>) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(name) {
            return Err(DbError::DuplicatedTable(name.to_string()));
        }
        if !fields.iter().any(|f| f.primary) {
            return Err(DbError::PrimaryKeyMissing);
        }

        let mut indexes = HashMap::new();
        for field in fields.iter_mut() {
            if field.primary || field.unique {
                if !matches!(field.ty, DataType::Int32 | DataType::Int64) {
                    return Err(DbError::InvalidField(format!(
                        "field {} must be an integer type to be indexed",
                        field.name
                    )));
                }
                let (tree, root_ptr_uid) = BTree::create(Arc::clone(&self.mvcc))?;
                field.index_uid = Some(root_ptr_uid);
                indexes.insert(field.name.clone(), tree);
            }
        }

        let head = read_booter(&self.booter_path)?;
        let meta = TableMeta {
            name: name.to_string(),
            fields: fields.clone(),
        };
        let entry_uid = self.mvcc.insert(SUPER_XID, &encode_entry(head, &meta)?)?;
        write_booter(&self.booter_path, entry_uid)?;

        tables.insert(
            name.to_string(),
            Arc::new(Table {
                uid: entry_uid,
                name: name.to_string(),
                fields,
                indexes,
            }),
        );
        Ok(())
    }

    /// Unlink a table's catalog entry. The predecessor's `next_uid` (or the
    /// booter, if the table is the head) is repointed past it; the entry
    /// itself is left on disk, unreachable.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        if !tables.contains_key(name) {
            return Err(DbError::TableNotFound(name.to_string()));
        }

        let mut prev_uid: Option<u64> = None;
        let mut uid = read_booter(&self.booter_path)?;
        loop {
            if uid == 0 {
                return Err(DbError::TableNotFound(name.to_string()));
            }
            let raw = self
                .mvcc
                .read(SUPER_XID, uid)?
                .ok_or_else(|| DbError::Internal("catalog: dangling entry uid".into()))?;
            let (next_uid, meta) = decode_entry(&raw)?;
            if meta.name == name {
                match prev_uid {
                    None => write_booter(&self.booter_path, next_uid)?,
                    Some(prev) => {
                        let prev_raw = self
                            .mvcc
                            .read(SUPER_XID, prev)?
                            .ok_or_else(|| DbError::Internal("catalog: dangling entry uid".into()))?;
                        let (_, prev_meta) = decode_entry(&prev_raw)?;
                        self.mvcc
                            .overwrite(SUPER_XID, prev, &encode_entry(next_uid, &prev_meta)?)?;
                    }
                }
                break;
            }
            prev_uid = Some(uid);
            uid = next_uid;
        }

        tables.remove(name);
        Ok(())
    }
}

/// Short-lived reservation table preventing two concurrent inserts from
/// both passing a unique-index check for the same (table, field, key)
/// before either has committed its B+ tree entry.
pub struct UniqueGuard {
    active: Mutex<std::collections::HashSet<(String, String, i64)>>,
}

impl UniqueGuard {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Reserve `(table, field, key)`; fails with `DuplicatedEntry` if
    /// another in-flight insert already holds it.
    pub fn reserve(&self, table: &str, field: &str, key: i64) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        let entry = (table.to_string(), field.to_string(), key);
        if active.contains(&entry) {
            return Err(DbError::DuplicatedEntry);
        }
        active.insert(entry);
        Ok(())
    }

    pub fn release(&self, table: &str, field: &str, key: i64) {
        self.active
            .lock()
            .unwrap()
            .remove(&(table.to_string(), field.to_string(), key));
    }
}

impl Default for UniqueGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_item::DataManager;
    use crate::fsm::FreeSpaceMap;
    use crate::lock_manager::LockManager;
    use crate::page_cache::PageCache;
    use crate::wal::Wal;
    use crate::xid::XidStore;

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::open(dir.path().join("t.db"), 4096).unwrap();
        let (wal, _) = Wal::open(dir.path().join("t.log"), 1 << 20).unwrap();
        let xid_store = Arc::new(XidStore::create(dir.path().join("t.xid")).unwrap());
        let data = Arc::new(DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new())));
        let mvcc = Arc::new(MvccEngine::new(xid_store, data, Arc::new(LockManager::new())));
        let booter_path = dir.path().join("t.bt");
        let catalog = Catalog::open(&booter_path, mvcc).unwrap();
        (dir, catalog)
    }

    fn id_field() -> Field {
        Field {
            name: "id".to_string(),
            ty: DataType::Int64,
            index_uid: None,
            unique: false,
            primary: true,
        }
    }

    #[test]
    fn create_and_reopen_round_trips_schema() {
        let (dir, catalog) = catalog();
        catalog
            .create_table(
                "users",
                vec![
                    id_field(),
                    Field {
                        name: "name".to_string(),
                        ty: DataType::String,
                        index_uid: None,
                        unique: false,
                        primary: false,
                    },
                ],
            )
            .unwrap();
        assert!(catalog.get("users").unwrap().field("id").unwrap().primary);
        assert!(catalog.get("users").unwrap().indexes.contains_key("id"));

        drop(catalog);
        let cache = PageCache::open(dir.path().join("t.db"), 4096).unwrap();
        let (wal, records) = Wal::open(dir.path().join("t.log"), 1 << 20).unwrap();
        assert!(records.len() > 0);
        let xid_store = Arc::new(XidStore::open(dir.path().join("t.xid")).unwrap());
        let data = Arc::new(DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new())));
        let mvcc = Arc::new(MvccEngine::new(xid_store, data, Arc::new(LockManager::new())));
        let reopened = Catalog::open(dir.path().join("t.bt"), mvcc).unwrap();
        assert!(reopened.get("users").is_some());
    }

    #[test]
    fn duplicate_table_name_rejected() {
        let (_dir, catalog) = catalog();
        catalog.create_table("users", vec![id_field()]).unwrap();
        let err = catalog.create_table("users", vec![id_field()]).unwrap_err();
        assert!(matches!(err, DbError::DuplicatedTable(_)));
    }

    #[test]
    fn drop_unlinks_and_preserves_siblings() {
        let (_dir, catalog) = catalog();
        catalog.create_table("a", vec![id_field()]).unwrap();
        catalog.create_table("b", vec![id_field()]).unwrap();
        catalog.create_table("c", vec![id_field()]).unwrap();
        catalog.drop_table("b").unwrap();
        assert!(catalog.get("b").is_none());
        assert!(catalog.get("a").is_some());
        assert!(catalog.get("c").is_some());
    }

    #[test]
    fn unique_guard_rejects_concurrent_reservation() {
        let guard = UniqueGuard::new();
        guard.reserve("users", "email", 42).unwrap();
        assert!(matches!(
            guard.reserve("users", "email", 42).unwrap_err(),
            DbError::DuplicatedEntry
        ));
        guard.release("users", "email", 42);
        guard.reserve("users", "email", 42).unwrap();
    }
}
