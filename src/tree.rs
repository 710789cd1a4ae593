//! The versioned tree handle
//!
//! A `Tree` binds a monotonic version counter to a bounded ring of
//! recent root references. Slot 0 is the current (mutable) root; slot
//! `k` is the snapshot at `version - k`. `save` finalizes the current
//! root, commits the pending batch, bumps the version, and shifts the
//! ring; roots falling off the end become unreachable.
//!
//! A handle is not safe for concurrent mutation. Readers take their own
//! handles with [`Tree::copy`] after a `save`; copies share persisted
//! nodes through the node store.

use crate::dump::{self, KeyValueMapping};
use crate::hash::Hash;
use crate::node::Node;
use crate::node_db::NodeDb;
use crate::proof::Proof;
use crate::store::KvStore;
use crate::{Error, Result, VERSION_COUNT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

fn next_tree_id() -> u64 {
    NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A versioned, authenticated key-value store over byte keys
pub struct Tree {
    ndb: Option<NodeDb>,
    version: u64,
    roots: Vec<Option<Arc<Node>>>,
    id: u64,
}

impl Tree {
    /// Create a persistent tree backed by `store`
    pub fn new(cache_size: usize, store: Arc<dyn KvStore>) -> Tree {
        Tree {
            ndb: Some(NodeDb::new(cache_size, store)),
            version: 0,
            roots: vec![None; VERSION_COUNT],
            id: next_tree_id(),
        }
    }

    /// Create a tree with no backing store
    pub fn in_memory() -> Tree {
        Tree {
            ndb: None,
            version: 0,
            roots: vec![None; VERSION_COUNT],
            id: next_tree_id(),
        }
    }

    /// Process-unique handle identifier, for debugging
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The root snapshot for `version`, if still retained in the ring
    pub fn get_root(&self, version: u64) -> Option<&Arc<Node>> {
        let index = self.version.checked_sub(version)? as usize;
        self.roots.get(index)?.as_ref()
    }

    fn current_root(&self) -> Option<&Arc<Node>> {
        self.roots[0].as_ref()
    }

    /// Leaf count of the current root; zero when empty
    pub fn size(&self) -> u64 {
        self.current_root().map_or(0, |root| root.size)
    }

    /// Height of the current root; zero when empty
    pub fn height(&self) -> i8 {
        self.current_root().map_or(0, |root| root.height)
    }

    /// Version stamped on the current root; zero when empty
    pub fn version(&self) -> u64 {
        self.current_root().map_or(0, |root| root.version)
    }

    pub fn is_empty(&self) -> bool {
        self.current_root().is_none()
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        match self.current_root() {
            None => Ok(false),
            Some(root) => root.has(self.ndb.as_ref(), key),
        }
    }

    /// Look up `key`, returning its in-order rank, its value, and
    /// whether it exists
    pub fn get(&self, key: &[u8]) -> Result<(u64, Option<Vec<u8>>, bool)> {
        match self.current_root() {
            None => Ok((0, None, false)),
            Some(root) => root.get(self.ndb.as_ref(), key),
        }
    }

    /// Look up `key` in the snapshot at `version`; absent versions read
    /// as missing keys
    pub fn get_version(&self, key: &[u8], version: u64) -> Result<(u64, Option<Vec<u8>>, bool)> {
        match self.get_root(version) {
            None => Ok((0, None, false)),
            Some(root) => root.get(self.ndb.as_ref(), key),
        }
    }

    /// Fetch the key/value at in-order position `index`
    pub fn get_by_index(&self, index: u64) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.current_root() {
            None => Ok(None),
            Some(root) => root.get_by_index(self.ndb.as_ref(), index),
        }
    }

    /// Insert or replace `key`; returns whether an existing value was
    /// replaced
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let root = match self.current_root() {
            None => {
                self.roots[0] = Some(Arc::new(Node::leaf(
                    key.to_vec(),
                    value.to_vec(),
                    self.version,
                )));
                return Ok(false);
            }
            Some(root) => root.clone(),
        };
        let (new_root, updated) = root.set(self.ndb.as_ref(), key, value, self.version)?;
        self.roots[0] = Some(new_root);
        Ok(updated)
    }

    /// Remove `key`, returning its value if it was present
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let root = match self.current_root() {
            None => return Ok(None),
            Some(root) => root.clone(),
        };
        let removed = match root.remove(self.ndb.as_ref(), key)? {
            None => return Ok(None),
            Some(removed) => removed,
        };

        self.roots[0] = match (removed.hash, removed.node) {
            (_, Some(node)) => Some(node),
            (Some(hash), None) => {
                // The surviving sibling was never materialized; load it.
                let ndb = self
                    .ndb
                    .as_ref()
                    .ok_or_else(|| Error::invariant("detached root without a backing store"))?;
                Some(ndb.get_node(&hash)?)
            }
            (None, None) => None,
        };
        Ok(Some(removed.value))
    }

    /// Root digest of the current version, computing it if necessary
    pub fn hash(&mut self) -> Result<Option<Hash>> {
        Ok(self.hash_with_count()?.0)
    }

    /// Root digest plus the number of digests newly computed
    pub fn hash_with_count(&mut self) -> Result<(Option<Hash>, u64)> {
        let root = match self.current_root() {
            None => return Ok((None, 0)),
            Some(root) => root.clone(),
        };
        let (hashed, hash, count) = Node::hash_with_count(&root)?;
        self.roots[0] = Some(hashed);
        Ok((Some(hash), count))
    }

    /// Finalize the current version as a snapshot: persist new nodes,
    /// commit the batch, bump the version, and shift the root ring.
    /// Returns the saved root digest, or `None` for an empty tree.
    pub fn save(&mut self) -> Result<Option<Hash>> {
        let root = match self.current_root() {
            None => return Ok(None),
            Some(root) => root.clone(),
        };

        let (hashed, root_hash, _) = Node::hash_with_count(&root)?;
        let finalized = match &self.ndb {
            Some(ndb) => {
                let saved = Node::save(&hashed, ndb)?;
                ndb.commit()?;
                saved
            }
            None => hashed,
        };

        self.version += 1;
        self.roots[0] = Some(finalized);
        for i in (1..VERSION_COUNT).rev() {
            self.roots[i] = self.roots[i - 1].clone();
        }
        Ok(Some(root_hash))
    }

    /// Replace the current root with the node stored under `hash`;
    /// `None` empties the tree. The version counter is unchanged.
    pub fn load(&mut self, hash: Option<&Hash>) -> Result<()> {
        let hash = match hash {
            None => {
                self.roots[0] = None;
                return Ok(());
            }
            Some(hash) => hash,
        };
        let ndb = self
            .ndb
            .as_ref()
            .ok_or_else(|| Error::invariant("load requires a backing store"))?;
        self.roots[0] = Some(ndb.get_node(hash)?);
        Ok(())
    }

    /// Produce an independent handle over the same store
    ///
    /// The current root must be persisted; a purely in-memory tree is
    /// finalized by computing its hashes. Ring entries are shared by
    /// reference.
    pub fn copy(&mut self) -> Result<Tree> {
        if let Some(root) = self.current_root() {
            if self.ndb.is_some() {
                if !root.persisted {
                    return Err(Error::invariant("copying an unpersisted tree"));
                }
            } else if root.hash.is_none() {
                self.hash_with_count()?;
            }
        }
        Ok(Tree {
            ndb: self.ndb.clone(),
            version: self.version,
            roots: self.roots.clone(),
            id: next_tree_id(),
        })
    }

    /// In-order walk over every leaf; the callback returns `true` to
    /// stop. Returns whether the walk stopped early.
    pub fn iterate<F>(&self, mut f: F) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        match self.current_root() {
            None => Ok(false),
            Some(root) => root.traverse(self.ndb.as_ref(), true, &mut |node| {
                if node.is_leaf() {
                    f(node.key(), node.value().unwrap_or_default())
                } else {
                    false
                }
            }),
        }
    }

    /// In-order walk over leaves with keys in `[start, end]` inclusive;
    /// `None` bounds are open
    pub fn iterate_range<F>(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        mut f: F,
    ) -> Result<bool>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        match self.current_root() {
            None => Ok(false),
            Some(root) => root.traverse_in_range(self.ndb.as_ref(), start, end, ascending, &mut |node| {
                if node.is_leaf() {
                    f(node.key(), node.value().unwrap_or_default())
                } else {
                    false
                }
            }),
        }
    }

    // === Proofs ===

    /// Build an inclusion proof for `key` against the current version
    pub fn construct_proof(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Proof)>> {
        // Make sure every digest on the path exists before descending.
        self.hash_with_count()?;
        match self.current_root() {
            None => Ok(None),
            Some(root) => Proof::construct(root, self.ndb.as_ref(), key),
        }
    }

    /// Proof for `key` at the current version, encoded for the wire
    pub fn proof(&mut self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .construct_proof(key)?
            .map(|(value, proof)| (value, proof.to_bytes())))
    }

    /// Proof for `key` at a historical `version` still in the ring
    pub fn proof_version(
        &mut self,
        key: &[u8],
        version: u64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if version == self.version {
            return self.proof(key);
        }
        let root = match self.get_root(version) {
            None => return Ok(None),
            Some(root) => root.clone(),
        };
        Ok(Proof::construct(&root, self.ndb.as_ref(), key)?
            .map(|(value, proof)| (value, proof.to_bytes())))
    }

    /// Dump the raw backing store through `mapping` (or the defaults)
    pub fn dump(&self, mapping: Option<&KeyValueMapping>) -> Result<()> {
        let ndb = self
            .ndb
            .as_ref()
            .ok_or_else(|| Error::invariant("dump requires a backing store"))?;
        let default_mapping = KeyValueMapping::default();
        dump::dump_store(ndb.store().as_ref(), mapping.unwrap_or(&default_mapping))
    }
}
