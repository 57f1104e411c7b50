//! Persistent B+ tree index over `(int64 key -> uid)`. (C9)
//!
//! Nodes are fixed-size MVCC data items under the super transaction, so a
//! plain key insertion that doesn't trigger a split is an equal-length
//! overwrite rather than a delete+insert — the node's own uid never
//! changes except when it's freshly created by a split. The root uid lives
//! in its own one-node "root pointer" item, overwritten in place when the
//! root splits.

use crate::config::BALANCE_NUMBER;
use crate::error::{DbError, Result};
use crate::mvcc::MvccEngine;
use crate::xid::SUPER_XID;
use std::sync::Arc;

const CAPACITY: usize = 2 * BALANCE_NUMBER;
const NODE_HEADER_LEN: usize = 11; // is_leaf(1) + key_count(2) + sibling_uid(8)
const PAIR_LEN: usize = 16; // son_uid(8) + key(8)

struct Node {
    is_leaf: bool,
    sibling_uid: u64,
    pairs: Vec<(u64, i64)>,
}

impl Node {
    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; NODE_HEADER_LEN + CAPACITY * PAIR_LEN];
        buf[0] = self.is_leaf as u8;
        buf[1..3].copy_from_slice(&(self.pairs.len() as u16).to_be_bytes());
        buf[3..11].copy_from_slice(&self.sibling_uid.to_be_bytes());
        for (i, (son, key)) in self.pairs.iter().enumerate() {
            let off = NODE_HEADER_LEN + i * PAIR_LEN;
            buf[off..off + 8].copy_from_slice(&son.to_be_bytes());
            buf[off + 8..off + 16].copy_from_slice(&key.to_be_bytes());
        }
        buf
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < NODE_HEADER_LEN {
            return Err(DbError::Internal("corrupt b+tree node".into()));
        }
        let is_leaf = raw[0] != 0;
        let key_count = u16::from_be_bytes(raw[1..3].try_into().unwrap()) as usize;
        let sibling_uid = u64::from_be_bytes(raw[3..11].try_into().unwrap());
        let mut pairs = Vec::with_capacity(key_count);
        for i in 0..key_count {
            let off = NODE_HEADER_LEN + i * PAIR_LEN;
            let son = u64::from_be_bytes(raw[off..off + 8].try_into().unwrap());
            let key = i64::from_be_bytes(raw[off + 8..off + 16].try_into().unwrap());
            pairs.push((son, key));
        }
        Ok(Self {
            is_leaf,
            sibling_uid,
            pairs,
        })
    }
}

/// Result of a node insert that caused a split: the (shrunk) original's new
/// bound, and the freshly created sibling with its own bound.
struct Split {
    original_bound: i64,
    sibling_uid: u64,
    sibling_bound: i64,
}

pub struct BTree {
    mvcc: Arc<MvccEngine>,
    root_ptr_uid: u64,
}

impl BTree {
    /// Create a brand-new, empty tree and return it along with the uid of
    /// its root-pointer item (to be stored in the field's catalog entry).
    pub fn create(mvcc: Arc<MvccEngine>) -> Result<(Self, u64)> {
        let root_leaf = Node {
            is_leaf: true,
            sibling_uid: 0,
            pairs: Vec::new(),
        };
        let root_uid = mvcc.insert(SUPER_XID, &root_leaf.encode())?;
        let root_ptr_uid = mvcc.insert(SUPER_XID, &root_uid.to_be_bytes())?;
        Ok((
            Self {
                mvcc,
                root_ptr_uid,
            },
            root_ptr_uid,
        ))
    }

    pub fn open(mvcc: Arc<MvccEngine>, root_ptr_uid: u64) -> Self {
        Self { mvcc, root_ptr_uid }
    }

    fn load(&self, uid: u64) -> Result<Node> {
        let body = self
            .mvcc
            .read(SUPER_XID, uid)?
            .ok_or(DbError::NullEntry)?;
        Node::decode(&body)
    }

    fn store_new(&self, node: &Node) -> Result<u64> {
        self.mvcc.insert(SUPER_XID, &node.encode())
    }

    fn overwrite(&self, uid: u64, node: &Node) -> Result<()> {
        self.mvcc.overwrite(SUPER_XID, uid, &node.encode())
    }

    fn get_root(&self) -> Result<u64> {
        let body = self
            .mvcc
            .read(SUPER_XID, self.root_ptr_uid)?
            .ok_or(DbError::NullEntry)?;
        Ok(u64::from_be_bytes(body[0..8].try_into().unwrap()))
    }

    fn set_root(&self, new_root: u64) -> Result<()> {
        self.mvcc
            .overwrite(SUPER_XID, self.root_ptr_uid, &new_root.to_be_bytes())
    }

    /// Insert `(key, uid)`. Duplicate keys are allowed; uniqueness is the
    /// caller's responsibility (see the catalog's `ensure_unique`).
    pub fn insert(&self, key: i64, uid: u64) -> Result<()> {
        let root = self.get_root()?;
        if let Some(split) = self.insert_into(root, key, uid)? {
            let new_root = Node {
                is_leaf: false,
                sibling_uid: 0,
                pairs: vec![
                    (root, split.original_bound),
                    (split.sibling_uid, split.sibling_bound),
                ],
            };
            let new_root_uid = self.store_new(&new_root)?;
            self.set_root(new_root_uid)?;
        }
        Ok(())
    }

    fn insert_into(&self, node_uid: u64, key: i64, uid: u64) -> Result<Option<Split>> {
        let mut node = self.load(node_uid)?;

        if node.is_leaf {
            let pos = node
                .pairs
                .iter()
                .position(|&(_, k)| k >= key)
                .unwrap_or(node.pairs.len());
            if pos == node.pairs.len() && node.sibling_uid != 0 {
                // A concurrent split moved keys past this node; retry there.
                return self.insert_into(node.sibling_uid, key, uid);
            }
            node.pairs.insert(pos, (uid, key));
        } else {
            let pos = node
                .pairs
                .iter()
                .position(|&(_, k)| k >= key)
                .unwrap_or(node.pairs.len());
            if pos == node.pairs.len() {
                if node.sibling_uid != 0 {
                    return self.insert_into(node.sibling_uid, key, uid);
                }
                return Err(DbError::Internal("b+tree: no route for key".into()));
            }
            let child_uid = node.pairs[pos].0;
            if let Some(split) = self.insert_into(child_uid, key, uid)? {
                node.pairs[pos].1 = split.original_bound;
                node.pairs
                    .insert(pos + 1, (split.sibling_uid, split.sibling_bound));
            } else {
                return Ok(None);
            }
        }

        if node.pairs.len() < CAPACITY {
            self.overwrite(node_uid, &node)?;
            return Ok(None);
        }

        // Split: lower half stays at `node_uid`, upper half becomes a new node.
        let upper: Vec<(u64, i64)> = node.pairs.split_off(BALANCE_NUMBER);
        let was_rightmost = node.sibling_uid == 0;
        let new_sibling_uid_slot = node.sibling_uid; // old next sibling, if any

        let sibling_bound = if was_rightmost {
            i64::MAX
        } else {
            upper.last().unwrap().1
        };
        let sibling = Node {
            is_leaf: node.is_leaf,
            sibling_uid: new_sibling_uid_slot,
            pairs: upper,
        };
        let sibling_uid = self.store_new(&sibling)?;

        let original_bound = node.pairs.last().unwrap().1;
        node.sibling_uid = sibling_uid;
        self.overwrite(node_uid, &node)?;

        Ok(Some(Split {
            original_bound,
            sibling_uid,
            sibling_bound,
        }))
    }

    fn find_leaf(&self, key: i64) -> Result<u64> {
        let mut node_uid = self.get_root()?;
        loop {
            let node = self.load(node_uid)?;
            if node.is_leaf {
                return Ok(node_uid);
            }
            let pos = node
                .pairs
                .iter()
                .position(|&(_, k)| k >= key)
                .unwrap_or(node.pairs.len());
            if pos == node.pairs.len() {
                if node.sibling_uid == 0 {
                    return Err(DbError::Internal("b+tree: no route for key".into()));
                }
                node_uid = node.sibling_uid;
                continue;
            }
            node_uid = node.pairs[pos].0;
        }
    }

    /// Return every `(key, row_uid)` pair with `lo <= key <= hi`.
    pub fn range_search(&self, lo: i64, hi: i64) -> Result<Vec<u64>> {
        let mut results = Vec::new();
        let mut node_uid = self.find_leaf(lo)?;
        'outer: loop {
            let node = self.load(node_uid)?;
            for &(row_uid, key) in &node.pairs {
                if key > hi {
                    break 'outer;
                }
                if key >= lo {
                    results.push(row_uid);
                }
            }
            if node.sibling_uid == 0 {
                break;
            }
            node_uid = node.sibling_uid;
        }
        Ok(results)
    }

    pub fn find(&self, key: i64) -> Result<Vec<u64>> {
        self.range_search(key, key)
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

    fn tree() -> BTree {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::open(dir.path().join("t.db"), 4096).unwrap();
        let (wal, _) = Wal::open(dir.path().join("t.log"), 1 << 20).unwrap();
        let xid_store = Arc::new(XidStore::create(dir.path().join("t.xid")).unwrap());
        std::mem::forget(dir);
        let data = Arc::new(DataManager::new(cache, wal, Arc::new(FreeSpaceMap::new())));
        let mvcc = Arc::new(MvccEngine::new(xid_store, data, Arc::new(LockManager::new())));
        let (tree, _root_ptr_uid) = BTree::create(mvcc).unwrap();
        tree
    }

    #[test]
    fn insert_and_exact_lookup() {
        let t = tree();
        t.insert(10, 1001).unwrap();
        t.insert(20, 1002).unwrap();
        t.insert(5, 1003).unwrap();
        assert_eq!(t.find(10).unwrap(), vec![1001]);
        assert_eq!(t.find(20).unwrap(), vec![1002]);
        assert_eq!(t.find(999).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn range_search_across_many_splits() {
        let t = tree();
        for i in 0..200i64 {
            t.insert(i, 10_000 + i as u64).unwrap();
        }
        let found = t.range_search(50, 100).unwrap();
        assert_eq!(found.len(), 51);
        for i in 50..=100i64 {
            assert!(found.contains(&(10_000 + i as u64)));
        }
    }

    #[test]
    fn duplicate_keys_all_returned() {
        let t = tree();
        t.insert(7, 1).unwrap();
        t.insert(7, 2).unwrap();
        t.insert(7, 3).unwrap();
        let mut found = t.find(7).unwrap();
        found.sort();
        assert_eq!(found, vec![1, 2, 3]);
    }
}
