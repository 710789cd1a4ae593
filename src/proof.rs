//! Merkle inclusion proofs
//!
//! A proof carries the proved leaf's digest, one step per inner node on
//! the path ordered leaf-to-root, and the root digest. Each step holds
//! exactly the sibling digest of the side not taken; the empty side is
//! where the running hash inserts during verification.

use crate::codec::{self, Reader};
use crate::hash::Hash;
use crate::node::{self, Node};
use crate::node_db::NodeDb;
use crate::{Error, Result};
use std::sync::Arc;

/// Maximum accepted size of an encoded proof, in bytes
pub const PROOF_LIMIT: usize = 1 << 16;

/// One inner node on the proved path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofInnerNode {
    pub height: i8,
    pub size: u64,
    /// Left sibling digest; `None` when the path came up the left side
    pub left: Option<Hash>,
    /// Right sibling digest; `None` when the path came up the right side
    pub right: Option<Hash>,
}

impl ProofInnerNode {
    /// Fold the running child digest into this step. The empty side is
    /// where the child inserts; a missing sibling encodes as an empty
    /// byte slice in the preimage.
    fn hash(&self, child: &Hash) -> Hash {
        let mut buf = Vec::with_capacity(64);
        codec::write_int8(&mut buf, self.height);
        codec::write_varint(&mut buf, self.size);
        match &self.left {
            None => {
                codec::write_byte_slice(&mut buf, child.as_ref());
                match &self.right {
                    Some(right) => codec::write_byte_slice(&mut buf, right.as_ref()),
                    None => codec::write_byte_slice(&mut buf, &[]),
                }
            }
            Some(left) => {
                codec::write_byte_slice(&mut buf, left.as_ref());
                codec::write_byte_slice(&mut buf, child.as_ref());
            }
        }
        Hash::digest(&buf)
    }
}

/// An inclusion proof for one key under one root digest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proof {
    pub leaf_hash: Hash,
    pub inner_nodes: Vec<ProofInnerNode>,
    pub root_hash: Hash,
}

impl Proof {
    /// The root digest this proof commits to
    pub fn root(&self) -> &Hash {
        &self.root_hash
    }

    /// Check that `key` maps to `value` under `root`, where `version`
    /// is the tree version that stamped the proved leaf
    pub fn verify(&self, key: &[u8], value: &[u8], root: &Hash, version: u64) -> bool {
        if &self.root_hash != root {
            return false;
        }
        if node::leaf_hash(key, value, version) != self.leaf_hash {
            return false;
        }
        let mut running = self.leaf_hash;
        for step in &self.inner_nodes {
            running = step.hash(&running);
        }
        running == self.root_hash
    }

    /// Canonical wire encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_byte_slice(&mut buf, self.leaf_hash.as_ref());
        codec::write_varint(&mut buf, self.inner_nodes.len() as u64);
        for step in &self.inner_nodes {
            codec::write_int8(&mut buf, step.height);
            codec::write_varint(&mut buf, step.size);
            write_opt_hash(&mut buf, &step.left);
            write_opt_hash(&mut buf, &step.right);
        }
        codec::write_byte_slice(&mut buf, self.root_hash.as_ref());
        buf
    }

    /// Decode a proof, rejecting oversized or malformed input
    pub fn from_bytes(data: &[u8]) -> Result<Proof> {
        if data.len() > PROOF_LIMIT {
            return Err(Error::decode(format!(
                "proof of {} bytes exceeds limit {}",
                data.len(),
                PROOF_LIMIT
            )));
        }
        let mut r = Reader::new(data);

        let leaf_hash = read_hash(&mut r)?;
        let count = r.read_varint()?;
        let mut inner_nodes = Vec::new();
        for _ in 0..count {
            let height = r.read_int8()?;
            let size = r.read_varint()?;
            let left = read_opt_hash(&mut r)?;
            let right = read_opt_hash(&mut r)?;
            inner_nodes.push(ProofInnerNode {
                height,
                size,
                left,
                right,
            });
        }
        let root_hash = read_hash(&mut r)?;
        r.expect_done()?;

        Ok(Proof {
            leaf_hash,
            inner_nodes,
            root_hash,
        })
    }

    /// Descend from a finalized root collecting sibling digests;
    /// returns the proved value and the proof, or `None` if the key is
    /// absent
    pub(crate) fn construct(
        root: &Arc<Node>,
        ndb: Option<&NodeDb>,
        key: &[u8],
    ) -> Result<Option<(Vec<u8>, Proof)>> {
        let root_hash = root
            .hash
            .ok_or_else(|| Error::invariant("proving against an unhashed root"))?;

        let mut steps = Vec::new();
        let found = construct_path(root, ndb, key, &mut steps)?;
        Ok(found.map(|(value, leaf_hash)| {
            (
                value,
                Proof {
                    leaf_hash,
                    inner_nodes: steps,
                    root_hash,
                },
            )
        }))
    }
}

fn write_opt_hash(buf: &mut Vec<u8>, hash: &Option<Hash>) {
    match hash {
        Some(h) => codec::write_byte_slice(buf, h.as_ref()),
        None => codec::write_byte_slice(buf, &[]),
    }
}

fn read_hash(r: &mut Reader<'_>) -> Result<Hash> {
    Hash::from_slice(r.read_byte_slice()?).ok_or_else(|| Error::decode("bad hash length"))
}

fn read_opt_hash(r: &mut Reader<'_>) -> Result<Option<Hash>> {
    let bytes = r.read_byte_slice()?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Hash::from_slice(bytes)
        .map(Some)
        .ok_or_else(|| Error::decode("bad sibling hash length"))
}

/// Appends one step per inner node on the way back up, carrying the
/// digest of the side not taken
fn construct_path(
    node: &Node,
    ndb: Option<&NodeDb>,
    key: &[u8],
    steps: &mut Vec<ProofInnerNode>,
) -> Result<Option<(Vec<u8>, Hash)>> {
    if node.height == 0 {
        if node.key == key {
            let leaf_hash = node
                .hash
                .ok_or_else(|| Error::invariant("unhashed leaf on proof path"))?;
            let value = node
                .value
                .clone()
                .ok_or_else(|| Error::invariant("leaf without value"))?;
            return Ok(Some((value, leaf_hash)));
        }
        return Ok(None);
    }

    if key < &node.key[..] {
        let left = node.left_node(ndb)?;
        let found = construct_path(&left, ndb, key, steps)?;
        if found.is_none() {
            return Ok(None);
        }
        let right = node.right_node(ndb)?;
        steps.push(ProofInnerNode {
            height: node.height,
            size: node.size,
            left: None,
            right: Some(
                right
                    .hash
                    .ok_or_else(|| Error::invariant("unhashed sibling on proof path"))?,
            ),
        });
        Ok(found)
    } else {
        let right = node.right_node(ndb)?;
        let found = construct_path(&right, ndb, key, steps)?;
        if found.is_none() {
            return Ok(None);
        }
        let left = node.left_node(ndb)?;
        steps.push(ProofInnerNode {
            height: node.height,
            size: node.size,
            left: Some(
                left.hash
                    .ok_or_else(|| Error::invariant("unhashed sibling on proof path"))?,
            ),
            right: None,
        });
        Ok(found)
    }
}
