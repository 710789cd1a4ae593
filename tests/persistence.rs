//! End-to-end persistence tests against the file backend

use merkledb::{FileStore, MemoryStore, Proof, Tree, DEFAULT_CACHE_SIZE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn test_save_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.db");

    let root = {
        let store = Arc::new(FileStore::create(&path).unwrap());
        let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store);
        for i in 0u32..50 {
            let key = format!("key-{:03}", i);
            let value = format!("value-{}", i);
            tree.set(key.as_bytes(), value.as_bytes()).unwrap();
        }
        tree.save().unwrap().unwrap()
    };

    let store = Arc::new(FileStore::open(&path).unwrap());
    let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store);
    tree.load(Some(&root)).unwrap();

    assert_eq!(tree.hash().unwrap(), Some(root));
    assert_eq!(tree.size(), 50);
    for i in 0u32..50 {
        let key = format!("key-{:03}", i);
        let (_, value, exists) = tree.get(key.as_bytes()).unwrap();
        assert!(exists, "{} present after reopen", key);
        assert_eq!(value.unwrap(), format!("value-{}", i).into_bytes());
    }
}

#[test]
fn test_proofs_verify_against_reloaded_root() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.db");

    let root = {
        let store = Arc::new(FileStore::create(&path).unwrap());
        let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store);
        for key in [b"alpha", b"bravo", b"delta", b"gamma"] {
            tree.set(key, key).unwrap();
        }
        tree.save().unwrap().unwrap()
    };

    let store = Arc::new(FileStore::open(&path).unwrap());
    let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store);
    tree.load(Some(&root)).unwrap();

    for key in [b"alpha", b"bravo", b"delta", b"gamma"] {
        let (value, bytes) = tree.proof(key).unwrap().unwrap();
        assert_eq!(&value[..], &key[..]);

        let proof = Proof::from_bytes(&bytes).unwrap();
        assert!(proof.verify(key, &value, &root, 0));
        assert!(!proof.verify(key, b"forged", &root, 0));
    }

    assert!(tree.proof(b"zulu").unwrap().is_none());
}

#[test]
fn test_historical_versions_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.db");

    let store = Arc::new(FileStore::create(&path).unwrap());
    let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store);

    tree.set(b"balance", b"100").unwrap();
    tree.save().unwrap();

    tree.set(b"balance", b"250").unwrap();
    tree.set(b"nonce", b"1").unwrap();
    tree.save().unwrap();

    tree.set(b"balance", b"0").unwrap();

    let (_, value, exists) = tree.get_version(b"balance", 0).unwrap();
    assert!(exists);
    assert_eq!(value.unwrap(), b"100");

    let (_, value, exists) = tree.get_version(b"balance", 1).unwrap();
    assert!(exists);
    assert_eq!(value.unwrap(), b"250");

    let (_, _, exists) = tree.get_version(b"nonce", 0).unwrap();
    assert!(!exists);

    let (_, value, exists) = tree.get(b"balance").unwrap();
    assert!(exists);
    assert_eq!(value.unwrap(), b"0");
}

#[test]
fn test_copies_share_the_store() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tree.db");

    let store = Arc::new(FileStore::create(&path).unwrap());
    let mut writer = Tree::new(DEFAULT_CACHE_SIZE, store);

    writer.set(b"k", b"v1").unwrap();
    writer.save().unwrap();

    let reader = writer.copy().unwrap();

    writer.set(b"k", b"v2").unwrap();
    writer.save().unwrap();

    // The reader's snapshot is unaffected by the writer's new version.
    let (_, value, exists) = reader.get(b"k").unwrap();
    assert!(exists);
    assert_eq!(value.unwrap(), b"v1");
}

#[test]
fn test_parallel_readers_share_the_node_store() {
    let store = Arc::new(MemoryStore::new());
    let mut writer = Tree::new(DEFAULT_CACHE_SIZE, store);
    for i in 0u32..100 {
        writer.set(&i.to_be_bytes(), format!("v{}", i).as_bytes()).unwrap();
    }
    writer.save().unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let reader = writer.copy().unwrap();
        handles.push(std::thread::spawn(move || {
            for i in 0u32..100 {
                let (_, value, exists) = reader.get(&i.to_be_bytes()).unwrap();
                assert!(exists);
                assert_eq!(value.unwrap(), format!("v{}", i).into_bytes());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_random_workload_matches_model() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut tree = Tree::in_memory();
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for _ in 0..500 {
        let key = format!("k{:04}", rng.gen_range(0..200)).into_bytes();
        if rng.gen_bool(0.7) {
            let value = format!("v{}", rng.gen_range(0..1000)).into_bytes();
            tree.set(&key, &value).unwrap();
            model.insert(key, value);
        } else {
            let removed = tree.remove(&key).unwrap();
            assert_eq!(removed, model.remove(&key));
        }
    }

    assert_eq!(tree.size(), model.len() as u64);
    for (key, value) in &model {
        let (_, got, exists) = tree.get(key).unwrap();
        assert!(exists);
        assert_eq!(got.as_deref(), Some(value.as_slice()));
    }

    let mut iterated = Vec::new();
    tree.iterate(|key, value| {
        iterated.push((key.to_vec(), value.to_vec()));
        false
    })
    .unwrap();
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(iterated, expected);
}

#[test]
fn test_random_workload_roundtrips_through_store() {
    let mut rng = StdRng::seed_from_u64(42);
    let store = Arc::new(MemoryStore::new());
    let mut tree = Tree::new(DEFAULT_CACHE_SIZE, store.clone());
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();

    for _ in 0..200 {
        let key = format!("k{:03}", rng.gen_range(0..80)).into_bytes();
        let value = format!("v{}", rng.gen_range(0..1000)).into_bytes();
        tree.set(&key, &value).unwrap();
        model.insert(key, value);
    }
    let root = tree.save().unwrap().unwrap();

    let mut fresh = Tree::new(DEFAULT_CACHE_SIZE, store);
    fresh.load(Some(&root)).unwrap();
    assert_eq!(fresh.size(), model.len() as u64);
    for (key, value) in &model {
        let (_, got, exists) = fresh.get(key).unwrap();
        assert!(exists, "{:?} present after load", key);
        assert_eq!(got.as_deref(), Some(value.as_slice()));
    }
}
