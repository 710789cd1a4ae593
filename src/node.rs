//! Tree nodes: AVL structure, digests, and persistence encoding
//!
//! Nodes are immutable once shared. Mutation is copy-on-write: `set` and
//! `remove` build replacement nodes along the touched path and release
//! superseded persisted nodes to the store's orphan set. A node is a
//! leaf iff its height is zero; inner nodes route on the smallest key of
//! their right subtree.
//!
//! Two distinct encodings exist. The hash preimage (leaf:
//! `int8(0) | varint(1) | key | value | varint(version)`; inner:
//! `int8(height) | varint(size) | left_hash | right_hash`) feeds
//! RIPEMD-160 and must be reproducible by proof verifiers. The
//! persistence encoding (`int8(height) | varint(size) | varint(version)
//! | key | value-or-child-hashes`) is what the store holds under the
//! node's hash.

use crate::codec::{self, Reader};
use crate::hash::Hash;
use crate::node_db::NodeDb;
use crate::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// A node of the balanced Merkle tree
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) height: i8,
    pub(crate) size: u64,
    pub(crate) version: u64,
    pub(crate) key: Vec<u8>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) left_hash: Option<Hash>,
    pub(crate) right_hash: Option<Hash>,
    pub(crate) left: Option<Arc<Node>>,
    pub(crate) right: Option<Arc<Node>>,
    pub(crate) hash: Option<Hash>,
    pub(crate) persisted: bool,
}

/// Result of removing a key from a subtree
///
/// `node` is the replacement subtree when one was built in memory;
/// `hash` alone means the surviving sibling lives only in the store.
/// `new_pivot` carries the new smallest key of the subtree upward so an
/// ancestor can fix its routing key.
pub(crate) struct Removed {
    pub hash: Option<Hash>,
    pub node: Option<Arc<Node>>,
    pub new_pivot: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Digest of a leaf preimage
pub(crate) fn leaf_hash(key: &[u8], value: &[u8], version: u64) -> Hash {
    let mut buf = Vec::with_capacity(key.len() + value.len() + 16);
    codec::write_int8(&mut buf, 0);
    codec::write_varint(&mut buf, 1);
    codec::write_byte_slice(&mut buf, key);
    codec::write_byte_slice(&mut buf, value);
    codec::write_varint(&mut buf, version);
    Hash::digest(&buf)
}

/// Digest of an inner-node preimage
pub(crate) fn inner_hash(height: i8, size: u64, left: &Hash, right: &Hash) -> Hash {
    let mut buf = Vec::with_capacity(64);
    codec::write_int8(&mut buf, height);
    codec::write_varint(&mut buf, size);
    codec::write_byte_slice(&mut buf, left.as_ref());
    codec::write_byte_slice(&mut buf, right.as_ref());
    Hash::digest(&buf)
}

/// Release a superseded node to the orphan set
fn remove_orphan(ndb: Option<&NodeDb>, node: &Node) -> Result<()> {
    if !node.persisted {
        return Ok(());
    }
    if let Some(db) = ndb {
        db.remove_node(node)?;
    }
    Ok(())
}

impl Node {
    /// Create a fresh leaf stamped with the tree version that created it
    pub(crate) fn leaf(key: Vec<u8>, value: Vec<u8>, version: u64) -> Node {
        Node {
            height: 0,
            size: 1,
            version,
            key,
            value: Some(value),
            left_hash: None,
            right_hash: None,
            left: None,
            right: None,
            hash: None,
            persisted: false,
        }
    }

    /// Join two leaves under a new inner node routing on `key`
    fn branch(key: Vec<u8>, left: Arc<Node>, right: Arc<Node>, version: u64) -> Node {
        Node {
            height: 1,
            size: 2,
            version,
            key,
            value: None,
            left_hash: None,
            right_hash: None,
            left: Some(left),
            right: Some(right),
            hash: None,
            persisted: false,
        }
    }

    pub fn height(&self) -> i8 {
        self.height
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn hash(&self) -> Option<&Hash> {
        self.hash.as_ref()
    }

    pub fn left_hash(&self) -> Option<&Hash> {
        self.left_hash.as_ref()
    }

    pub fn right_hash(&self) -> Option<&Hash> {
        self.right_hash.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    /// Unpersisted working copy of an inner node, hash cleared
    fn working_copy(&self) -> Node {
        debug_assert!(self.height > 0, "leaves are replaced, not copied");
        Node {
            height: self.height,
            size: self.size,
            version: self.version,
            key: self.key.clone(),
            value: None,
            left_hash: self.left_hash,
            right_hash: self.right_hash,
            left: self.left.clone(),
            right: self.right.clone(),
            hash: None,
            persisted: false,
        }
    }

    pub(crate) fn left_node(&self, ndb: Option<&NodeDb>) -> Result<Arc<Node>> {
        if let Some(left) = &self.left {
            return Ok(left.clone());
        }
        let hash = self
            .left_hash
            .ok_or_else(|| Error::invariant("inner node without left child"))?;
        let db = ndb.ok_or_else(|| Error::invariant("detached child without a backing store"))?;
        db.get_node(&hash)
    }

    pub(crate) fn right_node(&self, ndb: Option<&NodeDb>) -> Result<Arc<Node>> {
        if let Some(right) = &self.right {
            return Ok(right.clone());
        }
        let hash = self
            .right_hash
            .ok_or_else(|| Error::invariant("inner node without right child"))?;
        let db = ndb.ok_or_else(|| Error::invariant("detached child without a backing store"))?;
        db.get_node(&hash)
    }

    // === Lookups ===

    /// BST descent; at a missing key the rank is its in-order
    /// insertion point
    pub(crate) fn get(
        &self,
        ndb: Option<&NodeDb>,
        key: &[u8],
    ) -> Result<(u64, Option<Vec<u8>>, bool)> {
        if self.height == 0 {
            return Ok(match self.key[..].cmp(key) {
                Ordering::Equal => (0, self.value.clone(), true),
                Ordering::Less => (1, None, false),
                Ordering::Greater => (0, None, false),
            });
        }
        if key < &self.key[..] {
            self.left_node(ndb)?.get(ndb, key)
        } else {
            let right = self.right_node(ndb)?;
            let (index, value, exists) = right.get(ndb, key)?;
            Ok((index + (self.size - right.size), value, exists))
        }
    }

    pub(crate) fn has(&self, ndb: Option<&NodeDb>, key: &[u8]) -> Result<bool> {
        if self.height == 0 {
            return Ok(self.key == key);
        }
        if key < &self.key[..] {
            self.left_node(ndb)?.has(ndb, key)
        } else {
            self.right_node(ndb)?.has(ndb, key)
        }
    }

    /// Descend by left-subtree size; out-of-range indexes yield `None`
    pub(crate) fn get_by_index(
        &self,
        ndb: Option<&NodeDb>,
        index: u64,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.height == 0 {
            if index == 0 {
                let value = self
                    .value
                    .clone()
                    .ok_or_else(|| Error::invariant("leaf without value"))?;
                return Ok(Some((self.key.clone(), value)));
            }
            return Ok(None);
        }
        let left = self.left_node(ndb)?;
        if index < left.size {
            left.get_by_index(ndb, index)
        } else {
            self.right_node(ndb)?.get_by_index(ndb, index - left.size)
        }
    }

    // === Mutation ===

    /// Insert or replace `key`; returns the new subtree and whether an
    /// existing value was replaced
    pub(crate) fn set(
        &self,
        ndb: Option<&NodeDb>,
        key: &[u8],
        value: &[u8],
        version: u64,
    ) -> Result<(Arc<Node>, bool)> {
        if self.height == 0 {
            return Ok(match key.cmp(&self.key[..]) {
                Ordering::Less => {
                    // New leaf sorts first; the pivot is the larger key.
                    let new_leaf = Arc::new(Node::leaf(key.to_vec(), value.to_vec(), version));
                    let old_leaf = Arc::new(self.clone());
                    (
                        Arc::new(Node::branch(self.key.clone(), new_leaf, old_leaf, version)),
                        false,
                    )
                }
                Ordering::Equal => {
                    remove_orphan(ndb, self)?;
                    (
                        Arc::new(Node::leaf(key.to_vec(), value.to_vec(), version)),
                        true,
                    )
                }
                Ordering::Greater => {
                    let new_leaf = Arc::new(Node::leaf(key.to_vec(), value.to_vec(), version));
                    let old_leaf = Arc::new(self.clone());
                    (
                        Arc::new(Node::branch(key.to_vec(), old_leaf, new_leaf, version)),
                        false,
                    )
                }
            });
        }

        remove_orphan(ndb, self)?;
        let mut work = self.working_copy();
        let updated;
        if key < &self.key[..] {
            let (new_left, u) = self.left_node(ndb)?.set(ndb, key, value, version)?;
            work.left = Some(new_left);
            work.left_hash = None;
            updated = u;
        } else {
            let (new_right, u) = self.right_node(ndb)?.set(ndb, key, value, version)?;
            work.right = Some(new_right);
            work.right_hash = None;
            updated = u;
        }

        if updated {
            // Value replacement leaves shape untouched.
            Ok((Arc::new(work), true))
        } else {
            work.calc_height_and_size(ndb)?;
            Ok((work.balance(ndb)?, false))
        }
    }

    /// Remove `key`; `None` means the key was absent
    pub(crate) fn remove(&self, ndb: Option<&NodeDb>, key: &[u8]) -> Result<Option<Removed>> {
        if self.height == 0 {
            if self.key == key {
                remove_orphan(ndb, self)?;
                let value = self
                    .value
                    .clone()
                    .ok_or_else(|| Error::invariant("leaf without value"))?;
                return Ok(Some(Removed {
                    hash: None,
                    node: None,
                    new_pivot: None,
                    value,
                }));
            }
            return Ok(None);
        }

        if key < &self.key[..] {
            let removed = match self.left_node(ndb)?.remove(ndb, key)? {
                None => return Ok(None),
                Some(r) => r,
            };
            if removed.hash.is_none() && removed.node.is_none() {
                // The left leaf held the key; this node collapses to
                // its right subtree, whose smallest key is the pivot.
                remove_orphan(ndb, self)?;
                return Ok(Some(Removed {
                    hash: self.right_hash,
                    node: self.right.clone(),
                    new_pivot: Some(self.key.clone()),
                    value: removed.value,
                }));
            }
            remove_orphan(ndb, self)?;
            let mut work = self.working_copy();
            work.left_hash = removed.hash;
            work.left = removed.node;
            work.calc_height_and_size(ndb)?;
            let new_self = work.balance(ndb)?;
            Ok(Some(Removed {
                hash: new_self.hash,
                node: Some(new_self),
                new_pivot: removed.new_pivot,
                value: removed.value,
            }))
        } else {
            let removed = match self.right_node(ndb)?.remove(ndb, key)? {
                None => return Ok(None),
                Some(r) => r,
            };
            if removed.hash.is_none() && removed.node.is_none() {
                remove_orphan(ndb, self)?;
                return Ok(Some(Removed {
                    hash: self.left_hash,
                    node: self.left.clone(),
                    new_pivot: None,
                    value: removed.value,
                }));
            }
            remove_orphan(ndb, self)?;
            let mut work = self.working_copy();
            work.right_hash = removed.hash;
            work.right = removed.node;
            if let Some(pivot) = removed.new_pivot {
                work.key = pivot;
            }
            work.calc_height_and_size(ndb)?;
            let new_self = work.balance(ndb)?;
            Ok(Some(Removed {
                hash: new_self.hash,
                node: Some(new_self),
                new_pivot: None,
                value: removed.value,
            }))
        }
    }

    // === Balancing ===

    fn calc_height_and_size(&mut self, ndb: Option<&NodeDb>) -> Result<()> {
        let left = self.left_node(ndb)?;
        let right = self.right_node(ndb)?;
        self.height = 1 + left.height.max(right.height);
        self.size = left.size + right.size;
        Ok(())
    }

    fn calc_balance(&self, ndb: Option<&NodeDb>) -> Result<i32> {
        let left = self.left_node(ndb)?;
        let right = self.right_node(ndb)?;
        Ok(i32::from(left.height) - i32::from(right.height))
    }

    /// Rebalance a freshly rebuilt working copy
    fn balance(mut self, ndb: Option<&NodeDb>) -> Result<Arc<Node>> {
        let balance = self.calc_balance(ndb)?;
        if balance > 1 {
            if self.left_node(ndb)?.calc_balance(ndb)? >= 0 {
                // Left-left
                return Ok(Arc::new(self.rotate_right(ndb)?));
            }
            // Left-right
            let rotated = self.left_node(ndb)?.working_copy().rotate_left(ndb)?;
            self.left_hash = None;
            self.left = Some(Arc::new(rotated));
            return Ok(Arc::new(self.rotate_right(ndb)?));
        }
        if balance < -1 {
            if self.right_node(ndb)?.calc_balance(ndb)? <= 0 {
                // Right-right
                return Ok(Arc::new(self.rotate_left(ndb)?));
            }
            // Right-left
            let rotated = self.right_node(ndb)?.working_copy().rotate_right(ndb)?;
            self.right_hash = None;
            self.right = Some(Arc::new(rotated));
            return Ok(Arc::new(self.rotate_left(ndb)?));
        }
        Ok(Arc::new(self))
    }

    /// Hoist the left child; `self` becomes its right child
    fn rotate_right(mut self, ndb: Option<&NodeDb>) -> Result<Node> {
        let left = self.left_node(ndb)?;
        remove_orphan(ndb, &left)?;
        let mut new_top = left.working_copy();

        self.left_hash = new_top.right_hash;
        self.left = new_top.right.take();
        self.calc_height_and_size(ndb)?;

        new_top.right_hash = None;
        new_top.right = Some(Arc::new(self));
        new_top.calc_height_and_size(ndb)?;

        Ok(new_top)
    }

    /// Hoist the right child; `self` becomes its left child
    fn rotate_left(mut self, ndb: Option<&NodeDb>) -> Result<Node> {
        let right = self.right_node(ndb)?;
        remove_orphan(ndb, &right)?;
        let mut new_top = right.working_copy();

        self.right_hash = new_top.left_hash;
        self.right = new_top.left.take();
        self.calc_height_and_size(ndb)?;

        new_top.left_hash = None;
        new_top.left = Some(Arc::new(self));
        new_top.calc_height_and_size(ndb)?;

        Ok(new_top)
    }

    // === Finalization ===

    /// Compute any missing digests, returning the hashed subtree, its
    /// digest, and how many digests were computed. Idempotent: hashed
    /// subtrees are returned untouched.
    pub(crate) fn hash_with_count(node: &Arc<Node>) -> Result<(Arc<Node>, Hash, u64)> {
        if let Some(hash) = node.hash {
            return Ok((node.clone(), hash, 0));
        }

        if node.height == 0 {
            let value = node
                .value
                .as_ref()
                .ok_or_else(|| Error::invariant("leaf without value"))?;
            let hash = leaf_hash(&node.key, value, node.version);
            let mut hashed = node.as_ref().clone();
            hashed.hash = Some(hash);
            return Ok((Arc::new(hashed), hash, 1));
        }

        let mut count = 1;
        let (left, left_hash) = match (node.left_hash, &node.left) {
            (Some(hash), left) => (left.clone(), hash),
            (None, Some(left)) => {
                let (hashed, hash, c) = Node::hash_with_count(left)?;
                count += c;
                (Some(hashed), hash)
            }
            (None, None) => return Err(Error::invariant("inner node without left child")),
        };
        let (right, right_hash) = match (node.right_hash, &node.right) {
            (Some(hash), right) => (right.clone(), hash),
            (None, Some(right)) => {
                let (hashed, hash, c) = Node::hash_with_count(right)?;
                count += c;
                (Some(hashed), hash)
            }
            (None, None) => return Err(Error::invariant("inner node without right child")),
        };

        let hash = inner_hash(node.height, node.size, &left_hash, &right_hash);
        let mut hashed = node.as_ref().clone();
        hashed.left = left;
        hashed.left_hash = Some(left_hash);
        hashed.right = right;
        hashed.right_hash = Some(right_hash);
        hashed.hash = Some(hash);
        Ok((Arc::new(hashed), hash, count))
    }

    /// Persist the subtree post-order through the node store, detaching
    /// child references so cached snapshots can be evicted
    /// independently. Digests must already be computed.
    pub(crate) fn save(node: &Arc<Node>, ndb: &NodeDb) -> Result<Arc<Node>> {
        if node.persisted {
            return Ok(node.clone());
        }
        let hash = node
            .hash
            .ok_or_else(|| Error::invariant("saving a node with no hash"))?;

        let mut detached = node.as_ref().clone();
        detached.hash = Some(hash);
        if node.height > 0 {
            if let Some(left) = &node.left {
                detached.left_hash = Some(
                    Node::save(left, ndb)?
                        .hash
                        .ok_or_else(|| Error::invariant("persisted child with no hash"))?,
                );
            }
            if let Some(right) = &node.right {
                detached.right_hash = Some(
                    Node::save(right, ndb)?
                        .hash
                        .ok_or_else(|| Error::invariant("persisted child with no hash"))?,
                );
            }
            detached.left = None;
            detached.right = None;
        }
        ndb.save_node(detached)
    }

    // === Traversal ===

    /// In-order walk over every node; the callback returns `true` to
    /// stop early
    pub(crate) fn traverse<F>(&self, ndb: Option<&NodeDb>, ascending: bool, f: &mut F) -> Result<bool>
    where
        F: FnMut(&Node) -> bool,
    {
        self.traverse_in_range(ndb, None, None, ascending, f)
    }

    /// In-order walk bounded by inclusive keys; `None` is unbounded
    pub(crate) fn traverse_in_range<F>(
        &self,
        ndb: Option<&NodeDb>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        ascending: bool,
        f: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&Node) -> bool,
    {
        let after_start = start.map_or(true, |s| s <= &self.key[..]);
        let before_end = end.map_or(true, |e| &self.key[..] <= e);

        if after_start && before_end && f(self) {
            return Ok(true);
        }

        if self.height > 0 {
            if ascending {
                if after_start
                    && self
                        .left_node(ndb)?
                        .traverse_in_range(ndb, start, end, ascending, f)?
                {
                    return Ok(true);
                }
                if before_end
                    && self
                        .right_node(ndb)?
                        .traverse_in_range(ndb, start, end, ascending, f)?
                {
                    return Ok(true);
                }
            } else {
                if before_end
                    && self
                        .right_node(ndb)?
                        .traverse_in_range(ndb, start, end, ascending, f)?
                {
                    return Ok(true);
                }
                if after_start
                    && self
                        .left_node(ndb)?
                        .traverse_in_range(ndb, start, end, ascending, f)?
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // === Persistence encoding ===

    /// Encode for the external store (distinct from the hash preimage)
    pub(crate) fn write_persist_bytes(&self, buf: &mut Vec<u8>) -> Result<()> {
        codec::write_int8(buf, self.height);
        codec::write_varint(buf, self.size);
        codec::write_varint(buf, self.version);
        codec::write_byte_slice(buf, &self.key);
        if self.height == 0 {
            let value = self
                .value
                .as_ref()
                .ok_or_else(|| Error::invariant("leaf without value"))?;
            codec::write_byte_slice(buf, value);
        } else {
            let left = self
                .left_hash
                .ok_or_else(|| Error::invariant("unsaved left child"))?;
            let right = self
                .right_hash
                .ok_or_else(|| Error::invariant("unsaved right child"))?;
            codec::write_byte_slice(buf, left.as_ref());
            codec::write_byte_slice(buf, right.as_ref());
        }
        Ok(())
    }

    /// Decode a persisted node record. The digest is stamped separately
    /// from the store key by the node store.
    pub fn from_bytes(data: &[u8]) -> Result<Node> {
        let mut r = Reader::new(data);
        let height = r.read_int8()?;
        if height < 0 {
            return Err(Error::decode(format!("negative node height {}", height)));
        }
        let size = r.read_varint()?;
        let version = r.read_varint()?;
        let key = r.read_byte_slice()?.to_vec();

        let node = if height == 0 {
            let value = r.read_byte_slice()?.to_vec();
            Node {
                height,
                size,
                version,
                key,
                value: Some(value),
                left_hash: None,
                right_hash: None,
                left: None,
                right: None,
                hash: None,
                persisted: false,
            }
        } else {
            let left_hash = Hash::from_slice(r.read_byte_slice()?)
                .ok_or_else(|| Error::decode("bad left hash length"))?;
            let right_hash = Hash::from_slice(r.read_byte_slice()?)
                .ok_or_else(|| Error::decode("bad right hash length"))?;
            Node {
                height,
                size,
                version,
                key,
                value: None,
                left_hash: Some(left_hash),
                right_hash: Some(right_hash),
                left: None,
                right: None,
                hash: None,
                persisted: false,
            }
        };
        r.expect_done()?;
        Ok(node)
    }
}
