//! Debug dump of a raw backing store
//!
//! The dump walks the store iterator, not the tree, so it shows every
//! entry including unreachable ones. Keys and values go through
//! caller-supplied formatters; the defaults recognize node records and
//! the root metadata record, falling back to hex for anything else.

use crate::codec::Reader;
use crate::hash::Hash;
use crate::node::Node;
use crate::store::KvStore;
use crate::{Result, DELETES_KEY, ORPHANS_KEY, ROOTS_KEY};

/// Renders raw bytes for display
pub type Formatter = fn(&[u8]) -> String;

/// Key and value formatters used by the dump
pub struct KeyValueMapping {
    pub key: Formatter,
    pub value: Formatter,
}

impl Default for KeyValueMapping {
    fn default() -> Self {
        KeyValueMapping {
            key: format_key,
            value: format_value,
        }
    }
}

/// Default key formatter: reserved metadata keys by name, hex otherwise
pub fn format_key(key: &[u8]) -> String {
    for reserved in [ROOTS_KEY, ORPHANS_KEY, DELETES_KEY] {
        if key == reserved.as_bytes() {
            return reserved.to_string();
        }
    }
    hex::encode_upper(key)
}

/// Default value formatter: node record, then root metadata record,
/// then hex
pub fn format_value(value: &[u8]) -> String {
    if let Ok(node) = Node::from_bytes(value) {
        return describe_node(&node);
    }
    if let Some(described) = describe_root_record(value) {
        return described;
    }
    hex::encode_upper(value)
}

fn describe_node(node: &Node) -> String {
    if node.is_leaf() {
        format!(
            "Leaf[key: {}, value: {}, version: {}]",
            hex::encode_upper(node.key()),
            hex::encode_upper(node.value().unwrap_or_default()),
            node.version(),
        )
    } else {
        format!(
            "Inner[height: {}, size: {}, key: {}, left: {}, right: {}]",
            node.height(),
            node.size(),
            hex::encode_upper(node.key()),
            node.left_hash().map_or_else(|| "?".to_string(), Hash::short),
            node.right_hash().map_or_else(|| "?".to_string(), Hash::short),
        )
    }
}

/// Root metadata record: `byte_slice(root_hash) | varint(height)`
fn describe_root_record(value: &[u8]) -> Option<String> {
    let mut r = Reader::new(value);
    let hash = Hash::from_slice(r.read_byte_slice().ok()?)?;
    let height = r.read_varint().ok()?;
    r.expect_done().ok()?;
    Some(format!("Root[height: {}, hash: {}]", height, hash.short()))
}

/// Print stats and every entry of `store` through `mapping`
pub fn dump_store(store: &dyn KvStore, mapping: &KeyValueMapping) -> Result<()> {
    for (name, value) in store.stats() {
        println!("{}:\n\t{}", name, value);
    }
    for (key, value) in store.entries()? {
        println!(
            "DBkey: [{}] DBValue: [{}]",
            (mapping.key)(&key),
            (mapping.value)(&value)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn test_format_key_recognizes_reserved() {
        assert_eq!(format_key(ROOTS_KEY.as_bytes()), ROOTS_KEY);
        assert_eq!(format_key(&[0xAB, 0xCD]), "ABCD");
    }

    #[test]
    fn test_format_value_node() {
        let leaf = Node::leaf(b"k".to_vec(), b"v".to_vec(), 3);
        let mut buf = Vec::new();
        leaf.write_persist_bytes(&mut buf).unwrap();

        let rendered = format_value(&buf);
        assert!(rendered.starts_with("Leaf["));
        assert!(rendered.contains("version: 3"));
    }

    #[test]
    fn test_format_value_root_record() {
        let mut buf = Vec::new();
        codec::write_byte_slice(&mut buf, Hash::digest(b"root").as_ref());
        codec::write_varint(&mut buf, 12);

        let rendered = format_value(&buf);
        assert!(rendered.starts_with("Root["));
        assert!(rendered.contains("height: 12"));
    }

    #[test]
    fn test_format_value_falls_back_to_hex() {
        assert_eq!(format_value(&[0xDE, 0xAD]), "DEAD");
    }
}
