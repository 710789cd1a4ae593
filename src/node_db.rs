//! LRU-cached, mutex-protected front to the external store
//!
//! All node traffic between trees and the byte store goes through
//! [`NodeDb`]: demand-loading by hash, buffering writes into a batch,
//! and tracking orphaned (superseded) node hashes for later pruning.
//! One mutex guards cache, batch, and orphan state for the duration of
//! each call; callers must not reenter from within it.

use crate::node::Node;
use crate::store::{Batch, KvStore};
use crate::{Error, Hash, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Shared node store handle; clones refer to the same cache and batch
#[derive(Clone)]
pub struct NodeDb {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    state: Mutex<State>,
}

struct State {
    cache: LruCache<Hash, Arc<Node>>,
    batch: Batch,
    /// Hashes superseded in the pending version
    orphans: HashSet<Hash>,
    /// Hashes explicitly scheduled for cross-version pruning
    deletes: HashSet<Hash>,
}

impl NodeDb {
    pub fn new(cache_size: usize, store: Arc<dyn KvStore>) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("capacity is nonzero");
        NodeDb {
            inner: Arc::new(Inner {
                store,
                state: Mutex::new(State {
                    cache: LruCache::new(capacity),
                    batch: Batch::new(),
                    orphans: HashSet::new(),
                    deletes: HashSet::new(),
                }),
            }),
        }
    }

    /// The backing byte store
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.inner.store
    }

    /// Load a node by hash, promoting cache hits to most-recently-used
    pub fn get_node(&self, hash: &Hash) -> Result<Arc<Node>> {
        let mut state = self.inner.state.lock();

        if let Some(node) = state.cache.get(hash) {
            return Ok(node.clone());
        }

        let buf = self
            .inner
            .store
            .get(hash.as_ref())?
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::NodeMissing(hash.to_hex()))?;
        let mut node = Node::from_bytes(&buf)?;
        node.hash = Some(*hash);
        node.persisted = true;

        let node = Arc::new(node);
        state.cache.put(*hash, node.clone());
        Ok(node)
    }

    /// Append a finalized node to the pending batch and cache it.
    /// The node must carry its hash and must not already be persisted.
    pub fn save_node(&self, mut node: Node) -> Result<Arc<Node>> {
        let mut state = self.inner.state.lock();

        let hash = node
            .hash
            .ok_or_else(|| Error::invariant("saving a node with no hash"))?;
        if node.persisted {
            return Err(Error::invariant("saving an already persisted node"));
        }

        let mut buf = Vec::new();
        node.write_persist_bytes(&mut buf)?;
        state.batch.set(hash.as_ref(), &buf);
        node.persisted = true;

        let node = Arc::new(node);
        state.cache.put(hash, node.clone());

        // A node recreated within the same save cycle is no orphan.
        state.orphans.remove(&hash);
        Ok(node)
    }

    /// Drop a superseded node from the cache and record it as orphaned
    pub fn remove_node(&self, node: &Node) -> Result<()> {
        let mut state = self.inner.state.lock();

        let hash = node
            .hash
            .ok_or_else(|| Error::invariant("removing a node with no hash"))?;
        if !node.persisted {
            return Err(Error::invariant("removing a non-persisted node"));
        }

        state.cache.pop(&hash);
        state.orphans.insert(hash);
        Ok(())
    }

    /// Schedule a hash for deletion at the next prune, independent of
    /// the current orphan cycle
    pub fn mark_for_deletion(&self, hash: Hash) {
        self.inner.state.lock().deletes.insert(hash);
    }

    /// Queue batch deletes for every current orphan and every hash
    /// marked for deletion. Never invoked implicitly; pruning is caller
    /// policy.
    pub fn prune(&self) {
        let mut state = self.inner.state.lock();
        let State {
            batch,
            orphans,
            deletes,
            ..
        } = &mut *state;
        for hash in orphans.iter() {
            batch.delete(hash.as_ref());
        }
        for hash in deletes.drain() {
            batch.delete(hash.as_ref());
        }
    }

    /// Atomically write the pending batch, fence durability, open a
    /// fresh batch, and clear the orphan set
    pub fn commit(&self) -> Result<()> {
        let mut state = self.inner.state.lock();

        let batch = std::mem::take(&mut state.batch);
        self.inner.store.write(batch)?;
        self.inner.store.set_sync(&[], &[])?;

        state.orphans.clear();
        Ok(())
    }

    #[cfg(test)]
    fn orphan_count(&self) -> usize {
        self.inner.state.lock().orphans.len()
    }

    #[cfg(test)]
    fn cached(&self, hash: &Hash) -> bool {
        self.inner.state.lock().cache.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ndb(cache_size: usize) -> NodeDb {
        NodeDb::new(cache_size, Arc::new(MemoryStore::new()))
    }

    fn finalized_leaf(key: &[u8], value: &[u8]) -> Node {
        let leaf = Arc::new(Node::leaf(key.to_vec(), value.to_vec(), 0));
        let (hashed, _, _) = Node::hash_with_count(&leaf).unwrap();
        hashed.as_ref().clone()
    }

    #[test]
    fn test_save_then_get_roundtrip() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let hash = leaf.hash.unwrap();

        db.save_node(leaf).unwrap();
        db.commit().unwrap();

        let loaded = db.get_node(&hash).unwrap();
        assert_eq!(loaded.key(), b"k");
        assert_eq!(loaded.value(), Some(&b"v"[..]));
        assert!(loaded.persisted);
    }

    #[test]
    fn test_missing_node_is_fatal() {
        let db = ndb(16);
        let hash = Hash::digest(b"nowhere");
        match db.get_node(&hash) {
            Err(Error::NodeMissing(_)) => {}
            other => panic!("expected NodeMissing, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_save_requires_hash() {
        let db = ndb(16);
        let leaf = Node::leaf(b"k".to_vec(), b"v".to_vec(), 0);
        assert!(matches!(
            db.save_node(leaf),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_double_save_rejected() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let persisted = db.save_node(leaf).unwrap();
        assert!(matches!(
            db.save_node(persisted.as_ref().clone()),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_remove_requires_persisted() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        assert!(matches!(
            db.remove_node(&leaf),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_orphan_lifecycle() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let hash = leaf.hash.unwrap();
        let persisted = db.save_node(leaf).unwrap();
        db.commit().unwrap();

        db.remove_node(&persisted).unwrap();
        assert_eq!(db.orphan_count(), 1);
        assert!(!db.cached(&hash));

        // Re-saving within the same cycle rescues the node.
        let mut revived = persisted.as_ref().clone();
        revived.persisted = false;
        db.save_node(revived).unwrap();
        assert_eq!(db.orphan_count(), 0);
    }

    #[test]
    fn test_commit_clears_orphans() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let persisted = db.save_node(leaf).unwrap();
        db.commit().unwrap();

        db.remove_node(&persisted).unwrap();
        assert_eq!(db.orphan_count(), 1);
        db.commit().unwrap();
        assert_eq!(db.orphan_count(), 0);
    }

    #[test]
    fn test_prune_deletes_orphans() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let hash = leaf.hash.unwrap();
        let persisted = db.save_node(leaf).unwrap();
        db.commit().unwrap();

        db.remove_node(&persisted).unwrap();
        db.prune();
        db.commit().unwrap();

        assert!(matches!(db.get_node(&hash), Err(Error::NodeMissing(_))));
    }

    #[test]
    fn test_lru_eviction() {
        let db = ndb(2);
        let leaves = [
            finalized_leaf(b"a", b"1"),
            finalized_leaf(b"b", b"2"),
            finalized_leaf(b"c", b"3"),
        ];
        let hashes: Vec<Hash> = leaves.iter().map(|l| l.hash.unwrap()).collect();
        for leaf in leaves {
            db.save_node(leaf).unwrap();
        }
        db.commit().unwrap();

        // Capacity two: the oldest entry was evicted but still loads
        // from the store.
        assert!(!db.cached(&hashes[0]));
        assert!(db.cached(&hashes[1]));
        assert!(db.cached(&hashes[2]));
        assert!(db.get_node(&hashes[0]).is_ok());
    }

    #[test]
    fn test_mark_for_deletion_pruned() {
        let db = ndb(16);
        let leaf = finalized_leaf(b"k", b"v");
        let hash = leaf.hash.unwrap();
        db.save_node(leaf).unwrap();
        db.commit().unwrap();

        db.mark_for_deletion(hash);
        db.prune();
        db.commit().unwrap();

        assert!(matches!(db.get_node(&hash), Err(Error::NodeMissing(_))));
    }
}
