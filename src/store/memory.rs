//! In-memory store backend
//!
//! Keeps entries in an ordered map so iteration for the debug dump is
//! deterministic. Useful for tests and for trees that never outlive the
//! process.

use crate::store::{Batch, BatchOp, KvStore};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A `KvStore` backed by a `BTreeMap`
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut map = self.map.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Set { key, value } => {
                    map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            // Durability fence; nothing to flush in memory.
            return Ok(());
        }
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn entries(&self) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(snapshot.into_iter()))
    }

    fn stats(&self) -> Vec<(String, String)> {
        vec![
            ("backend".to_string(), "memory".to_string()),
            ("entries".to_string(), self.len().to_string()),
        ]
    }
}
