//! # merkledb
//!
//! A versioned, authenticated key-value store built on an immutable
//! balanced Merkle tree.
//!
//! The tree maps arbitrary byte keys to byte values and produces, for
//! any key, a compact cryptographic proof that the key maps to a given
//! value under a specified root digest. Snapshots of the last few
//! versions stay readable, so historical reads and proofs remain
//! available until they fall off the retention ring.
//!
//! ## Core Concepts
//!
//! - **Nodes**: immutable leaf/inner records; mutation is copy-on-write
//! - **Node store**: an LRU-cached front to a byte-addressed backing
//!   store, with batched writes and orphan tracking
//! - **Versions**: `save` finalizes a snapshot, commits the batch, and
//!   shifts a bounded ring of recent roots
//! - **Proofs**: leaf-to-root sibling paths verifiable from bytes alone
//!
//! ## Example
//!
//! ```ignore
//! use merkledb::{MemoryStore, Tree, DEFAULT_CACHE_SIZE};
//! use std::sync::Arc;
//!
//! let mut tree = Tree::new(DEFAULT_CACHE_SIZE, Arc::new(MemoryStore::new()));
//! tree.set(b"name", b"satoshi")?;
//! let root = tree.save()?.unwrap();
//!
//! let (value, proof_bytes) = tree.proof(b"name")?.unwrap();
//! ```

pub mod codec;
pub mod dump;
pub mod store;

mod error;
mod hash;
mod node;
mod node_db;
mod proof;
mod tree;

pub use dump::{dump_store, Formatter, KeyValueMapping};
pub use error::{Error, Result};
pub use hash::{Hash, HASH_SIZE};
pub use node::Node;
pub use node_db::NodeDb;
pub use proof::{Proof, ProofInnerNode, PROOF_LIMIT};
pub use store::{Batch, BatchOp, FileStore, KvStore, MemoryStore};
pub use tree::Tree;

/// Magic bytes identifying a merkledb store file
pub const MAGIC: &[u8; 8] = b"MERKLEDB";

/// Store file format version
pub const FORMAT_VERSION: u32 = 1;

/// Number of recent versions whose roots are retained in memory
pub const VERSION_COUNT: usize = 5;

/// Default node cache capacity
pub const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Reserved store key for durable version metadata. Declared for format
/// stability; nothing writes it yet.
pub const ROOTS_KEY: &str = "go-merkle:roots";

/// Reserved store key for durable orphan sets
pub const ORPHANS_KEY: &str = "go-merkle:orphans";

/// Reserved store key for durable delete schedules
pub const DELETES_KEY: &str = "go-merkle:deletes";
