//! Single-file store backend
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("MERKLEDB")
//!   - format version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - entry_count: 8 bytes (u64 LE)
//!   - index_offset: 8 bytes (u64 LE)
//!   - reserved: 32 bytes
//!
//! [RECORDS: variable]
//!   - value bytes, concatenated
//!
//! [INDEX: variable]
//!   - per entry: key_len (u16 LE), key, offset (u64 LE), size (u32 LE)
//! ```
//!
//! The index block is rewritten by `sync()` (and on drop); records
//! appended since the last sync are unreachable after a crash, so the
//! durability fence in [`KvStore::set_sync`] is what makes a commit
//! visible across reopen.

use crate::store::{Batch, BatchOp, KvStore};
use crate::{Error, Result, FORMAT_VERSION, MAGIC};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 64;

#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

/// A `KvStore` backed by a single append-mostly file
pub struct FileStore {
    path: PathBuf,
    file: RwLock<File>,
    index: RwLock<HashMap<Vec<u8>, IndexEntry>>,
    write_offset: RwLock<u64>,
}

impl FileStore {
    /// Create a new store file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(HashMap::new()),
            write_offset: RwLock::new(HEADER_SIZE),
        })
    }

    /// Open an existing store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("bad magic bytes".into()));
        }

        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::VersionMismatch {
                expected: FORMAT_VERSION,
                found: version,
            });
        }

        let entry_count = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let index_offset = u64::from_le_bytes(header[24..32].try_into().unwrap());

        let mut index = HashMap::new();
        if index_offset > 0 && entry_count > 0 {
            file.seek(SeekFrom::Start(index_offset))?;
            for _ in 0..entry_count {
                let mut len_buf = [0u8; 2];
                file.read_exact(&mut len_buf)?;
                let key_len = u16::from_le_bytes(len_buf) as usize;

                let mut key = vec![0u8; key_len];
                file.read_exact(&mut key)?;

                let mut tail = [0u8; 12];
                file.read_exact(&mut tail)?;
                let offset = u64::from_le_bytes(tail[0..8].try_into().unwrap());
                let size = u32::from_le_bytes(tail[8..12].try_into().unwrap());

                index.insert(key, IndexEntry { offset, size });
            }
        }

        let write_offset = if index_offset > 0 {
            index_offset
        } else {
            file.seek(SeekFrom::End(0))?
        };

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(index),
            write_offset: RwLock::new(write_offset),
        })
    }

    /// Open a store file, creating it if absent
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the index block and header, then flush to stable storage
    pub fn sync(&self) -> Result<()> {
        let index = self.index.read();
        let write_offset = *self.write_offset.read();
        let mut file = self.file.write();

        file.seek(SeekFrom::Start(16))?;
        file.write_all(&(index.len() as u64).to_le_bytes())?;
        file.write_all(&write_offset.to_le_bytes())?;

        file.seek(SeekFrom::Start(write_offset))?;

        // Sort by key so the block is deterministic.
        let mut entries: Vec<_> = index.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (key, entry) in entries {
            file.write_all(&(key.len() as u16).to_le_bytes())?;
            file.write_all(key)?;
            file.write_all(&entry.offset.to_le_bytes())?;
            file.write_all(&entry.size.to_le_bytes())?;
        }

        file.sync_all()?;
        Ok(())
    }

    /// Append one record, assuming locks are already held
    fn append_record(
        file: &mut File,
        write_offset: &mut u64,
        value: &[u8],
    ) -> Result<IndexEntry> {
        let offset = *write_offset;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(value)?;
        *write_offset = offset + value.len() as u64;
        Ok(IndexEntry {
            offset,
            size: value.len() as u32,
        })
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entry = {
            let index = self.index.read();
            match index.get(key) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut data = vec![0u8; entry.size as usize];
        file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    fn write(&self, batch: Batch) -> Result<()> {
        let mut index = self.index.write();
        let mut write_offset = self.write_offset.write();
        let mut file = self.file.write();

        for op in batch.into_ops() {
            match op {
                BatchOp::Set { key, value } => {
                    let entry = Self::append_record(&mut file, &mut write_offset, &value)?;
                    index.insert(key, entry);
                }
                BatchOp::Delete { key } => {
                    index.remove(&key);
                }
            }
        }

        file.sync_all()?;
        Ok(())
    }

    fn set_sync(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if !key.is_empty() {
            let mut index = self.index.write();
            let mut write_offset = self.write_offset.write();
            let mut file = self.file.write();
            let entry = Self::append_record(&mut file, &mut write_offset, value)?;
            index.insert(key.to_vec(), entry);
        }
        self.sync()
    }

    fn entries(&self) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>> {
        let mut keys: Vec<Vec<u8>> = self.index.read().keys().cloned().collect();
        keys.sort();

        let mut snapshot = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key)? {
                snapshot.push((key, value));
            }
        }
        Ok(Box::new(snapshot.into_iter()))
    }

    fn stats(&self) -> Vec<(String, String)> {
        let size = self
            .file
            .read()
            .metadata()
            .map(|m| m.len().to_string())
            .unwrap_or_else(|_| "?".to_string());
        vec![
            ("backend".to_string(), "file".to_string()),
            ("path".to_string(), self.path.display().to_string()),
            ("entries".to_string(), self.index.read().len().to_string()),
            ("file_bytes".to_string(), size),
        ]
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort index flush on drop.
        let _ = self.sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = FileStore::create(&path).unwrap();
            let mut batch = Batch::new();
            batch.set(b"k1", b"v1");
            batch.set(b"k2", b"v2");
            store.write(batch).unwrap();
            store.set_sync(b"", b"").unwrap();
        }

        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));
            assert_eq!(store.get(b"k2").unwrap(), Some(b"v2".to_vec()));
            assert_eq!(store.get(b"k3").unwrap(), None);
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, [0u8; 64]).unwrap();

        match FileStore::open(&path) {
            Err(Error::InvalidFile(_)) => {}
            other => panic!("expected InvalidFile, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_delete_unindexes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = FileStore::create(&path).unwrap();

        let mut batch = Batch::new();
        batch.set(b"k", b"v");
        store.write(batch).unwrap();

        let mut batch = Batch::new();
        batch.delete(b"k");
        store.write(batch).unwrap();

        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = FileStore::create(&path).unwrap();

        let mut batch = Batch::new();
        batch.set(b"k", b"old");
        batch.set(b"k", b"new");
        store.write(batch).unwrap();

        assert_eq!(store.get(b"k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_entries_sorted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = FileStore::create(&path).unwrap();

        let mut batch = Batch::new();
        batch.set(b"z", b"3");
        batch.set(b"a", b"1");
        batch.set(b"m", b"2");
        store.write(batch).unwrap();

        let keys: Vec<Vec<u8>> = store.entries().unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_sync_survives_further_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let store = FileStore::create(&path).unwrap();
            let mut batch = Batch::new();
            batch.set(b"first", b"1");
            store.write(batch).unwrap();
            store.sync().unwrap();

            // Appending after a sync overwrites the old index block;
            // the next sync (via drop) must still index everything.
            let mut batch = Batch::new();
            batch.set(b"second", b"2");
            store.write(batch).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"first").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"second").unwrap(), Some(b"2".to_vec()));
    }
}
