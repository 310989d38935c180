//! # Patricia Tree
//!
//! An immutable binary radix tree with cached subtree hashes. It is the
//! canonical commitment to ledger state: the root hash of this tree is what
//! a block header commits to.
//!
//! ## Shape
//!
//! ```text
//!            [1111]              internal: key = longest common prefix
//!            /    \
//!   [11110000]    [11111111]     leaves: full key, value
//! ```
//!
//! Byte keys are expanded MSB-first into one symbol (0 or 1) per bit before
//! any tree operation, so every internal node has exactly two children and
//! branches on the bit that follows its key.
//!
//! Two invariants hold for every tree:
//!
//! 1. An internal node's key is the longest common prefix of its children's
//!    keys. There are no single-child chains.
//! 2. No leaf key is a strict prefix of another key. Inserts or deletes that
//!    would violate this fail with [`TreeError::PrefixConflict`] and leave
//!    the tree untouched.
//!
//! ## Hashing
//!
//! - leaf: `H(value bytes)`, or the value itself when it already is a hash
//! - internal: `H(left.hash || right.hash)`
//! - empty tree: [`ZERO_HASH`]
//!
//! ## Persistence
//!
//! Nodes are shared behind `Arc` and never mutated. A mutation path-copies
//! from the root down to the changed leaf, so cloning a [`Tree`] is a cheap
//! snapshot: the clone keeps seeing the old root no matter what happens to
//! the original afterwards.
//!
//! Every tree also tracks a [`Delta`] of the nodes written and removed
//! since it was loaded (or since the last [`Tree::take_delta`]), which lets
//! the storage layer persist only what changed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::crypto::hash::{blake3_hash, blake3_hash_multi, Hash, ZERO_HASH};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    /// The key contains, or is contained by, another key in the tree.
    #[error("prefix conflict at key {0}")]
    PrefixConflict(String),

    /// A flat node set could not be assembled into a valid tree.
    #[error("corrupt node set: {0}")]
    CorruptNodeSet(String),
}

pub type TreeResult<T> = Result<T, TreeError>;

// ---------------------------------------------------------------------------
// Bit keys
// ---------------------------------------------------------------------------

/// Expand bytes into bit symbols, most significant bit first.
pub fn bits_from_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for shift in (0..8).rev() {
            bits.push((byte >> shift) & 1);
        }
    }
    bits
}

/// Pack bit symbols into bytes (MSB first, zero padded). The bit length
/// must be carried separately.
pub fn pack_bits(bits: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit == 1 {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// Inverse of [`pack_bits`]. Returns `None` if `len` exceeds the packed data.
pub fn unpack_bits(packed: &[u8], len: usize) -> Option<Vec<u8>> {
    if len > packed.len() * 8 {
        return None;
    }
    let mut bits = bits_from_bytes(packed);
    bits.truncate(len);
    Some(bits)
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn render_bits(bits: &[u8]) -> String {
    const MAX: usize = 64;
    let mut s: String = bits
        .iter()
        .take(MAX)
        .map(|b| if *b == 0 { '0' } else { '1' })
        .collect();
    if bits.len() > MAX {
        s.push_str(&format!("..({} bits)", bits.len()));
    }
    s
}

// ---------------------------------------------------------------------------
// Values and nodes
// ---------------------------------------------------------------------------

/// What a leaf stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Raw bytes; the leaf hash is `H(bytes)`.
    Bytes(Vec<u8>),
    /// An already-hashed commitment; the leaf hash is the value itself.
    Hash(Hash),
}

impl Value {
    pub fn hash(&self) -> Hash {
        match self {
            Value::Bytes(bytes) => blake3_hash(bytes),
            Value::Hash(hash) => *hash,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            Value::Hash(_) => None,
        }
    }
}

#[derive(Debug)]
enum NodeKind {
    Leaf(Value),
    Internal([Arc<Node>; 2]),
}

/// A tree node. Immutable once built.
#[derive(Debug)]
pub struct Node {
    key: Vec<u8>,
    hash: Hash,
    kind: NodeKind,
}

impl Node {
    fn leaf(key: Vec<u8>, value: Value) -> Arc<Node> {
        Arc::new(Node {
            key,
            hash: value.hash(),
            kind: NodeKind::Leaf(value),
        })
    }

    fn internal(key: Vec<u8>, children: [Arc<Node>; 2]) -> Arc<Node> {
        let hash = blake3_hash_multi(&[&children[0].hash, &children[1].hash]);
        Arc::new(Node {
            key,
            hash,
            kind: NodeKind::Internal(children),
        })
    }

    /// The node's key as bit symbols.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            NodeKind::Leaf(value) => Some(value),
            NodeKind::Internal(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[Arc<Node>; 2]> {
        match &self.kind {
            NodeKind::Internal(children) => Some(children),
            NodeKind::Leaf(_) => None,
        }
    }

    /// Flat record for serialization.
    pub fn to_record(&self) -> NodeRecord {
        NodeRecord {
            key_bits: self.key.len() as u32,
            key: pack_bits(&self.key),
            is_leaf: self.is_leaf(),
            hash: self.hash,
            value: self.value().cloned(),
        }
    }
}

/// One node of a flattened tree: key, leaf flag, hash and (for leaves) the
/// stored value or hash marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub key_bits: u32,
    /// Packed key bits, see [`pack_bits`].
    pub key: Vec<u8>,
    pub is_leaf: bool,
    pub hash: Hash,
    pub value: Option<Value>,
}

impl NodeRecord {
    pub fn bits(&self) -> Option<Vec<u8>> {
        unpack_bits(&self.key, self.key_bits as usize)
    }
}

// ---------------------------------------------------------------------------
// Delta
// ---------------------------------------------------------------------------

/// Nodes written and removed since a tree was loaded.
///
/// Keys are bit-symbol keys. A key removed and then written again within
/// the same session is reported as updated, because storage still holds a
/// row for it that has to be overwritten.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    inserted: BTreeMap<Vec<u8>, Arc<Node>>,
    updated: BTreeMap<Vec<u8>, Arc<Node>>,
    deleted: BTreeSet<Vec<u8>>,
}

impl Delta {
    pub fn inserted(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.inserted.values()
    }

    pub fn updated(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.updated.values()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.deleted.iter()
    }

    pub fn is_inserted(&self, bits: &[u8]) -> bool {
        self.inserted.contains_key(bits)
    }

    pub fn is_updated(&self, bits: &[u8]) -> bool {
        self.updated.contains_key(bits)
    }

    pub fn is_deleted(&self, bits: &[u8]) -> bool {
        self.deleted.contains(bits)
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    fn record_write(&mut self, node: Arc<Node>, replaced: bool) {
        let key = node.key.clone();
        if self.deleted.remove(&key) {
            self.updated.insert(key, node);
        } else if self.inserted.contains_key(&key) {
            self.inserted.insert(key, node);
        } else if replaced {
            self.updated.insert(key, node);
        } else {
            self.inserted.insert(key, node);
        }
    }

    fn record_removal(&mut self, key: Vec<u8>) {
        if self.inserted.remove(&key).is_none() {
            self.updated.remove(&key);
            self.deleted.insert(key);
        }
    }
}

enum Event {
    Write { node: Arc<Node>, replaced: bool },
    Remove(Vec<u8>),
}

/// What an insert did to the leaf at the given key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mutation {
    Inserted,
    Updated,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A handle on a tree root plus its mutation delta.
///
/// Mutating methods take `&mut self` and swap in a new root; clones taken
/// earlier keep the old root.
#[derive(Clone, Debug, Default)]
pub struct Tree {
    root: Option<Arc<Node>>,
    delta: Delta,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tree from a flat node set, such as one produced by
    /// [`walk`](Self::walk) or read back from storage.
    ///
    /// Records may arrive in any order. The exact topology is reproduced and
    /// every stored hash is checked against the recomputed one. The returned
    /// tree starts with an empty delta.
    pub fn from_nodes(records: Vec<NodeRecord>) -> TreeResult<Self> {
        if records.is_empty() {
            return Ok(Self::new());
        }

        let mut keyed = Vec::with_capacity(records.len());
        for record in records {
            let bits = record.bits().ok_or_else(|| {
                TreeError::CorruptNodeSet(format!("key length {} overflows", record.key_bits))
            })?;
            keyed.push((bits, record));
        }
        // Lexicographic order on bit keys puts a prefix before its
        // extensions, which is exactly pre-order.
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut pos = 0;
        let root = build_from_records(&keyed, &mut pos)?;
        if pos != keyed.len() {
            return Err(TreeError::CorruptNodeSet(format!(
                "{} records not reachable from root",
                keyed.len() - pos
            )));
        }

        Ok(Self {
            root: Some(root),
            delta: Delta::default(),
        })
    }

    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root_hash(&self) -> Hash {
        self.root.as_ref().map(|n| n.hash).unwrap_or(ZERO_HASH)
    }

    /// Exact-match lookup of a byte key.
    pub fn lookup(&self, key: &[u8]) -> Option<&Value> {
        let bits = bits_from_bytes(key);
        let mut node = self.root.as_ref()?;
        loop {
            if node.key == bits {
                return node.value();
            }
            if !bits.starts_with(&node.key) {
                return None;
            }
            let children = node.children()?;
            node = &children[bits[node.key.len()] as usize];
        }
    }

    /// Insert or replace the value at a byte key.
    pub fn insert(&mut self, key: &[u8], value: Value) -> TreeResult<Mutation> {
        let bits = bits_from_bytes(key);
        let mut events = Vec::new();

        let (new_root, mutation) = match &self.root {
            None => {
                let leaf = Node::leaf(bits, value);
                events.push(Event::Write {
                    node: leaf.clone(),
                    replaced: false,
                });
                (leaf, Mutation::Inserted)
            }
            Some(root) => {
                let mut mutation = Mutation::Inserted;
                let node = insert_at(root, &bits, &value, &mut events, &mut mutation)?;
                (node, mutation)
            }
        };

        self.root = Some(new_root);
        self.apply(events);
        Ok(mutation)
    }

    /// Remove the leaf at a byte key. Removing an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> TreeResult<()> {
        let bits = bits_from_bytes(key);
        let Some(root) = &self.root else {
            return Ok(());
        };

        let mut events = Vec::new();
        let new_root = delete_at(root, &bits, &mut events)?;
        self.root = new_root;
        self.apply(events);
        Ok(())
    }

    /// Pre-order traversal: every node is visited before its children,
    /// left child before right.
    pub fn walk<E>(&self, mut visit: impl FnMut(&Node) -> Result<(), E>) -> Result<(), E> {
        fn go<E>(node: &Node, visit: &mut impl FnMut(&Node) -> Result<(), E>) -> Result<(), E> {
            visit(node)?;
            if let Some(children) = node.children() {
                go(&children[0], visit)?;
                go(&children[1], visit)?;
            }
            Ok(())
        }
        match &self.root {
            Some(root) => go(root, &mut visit),
            None => Ok(()),
        }
    }

    /// Flatten the tree into pre-order node records.
    pub fn records(&self) -> Vec<NodeRecord> {
        let mut out = Vec::new();
        let _ = self.walk(|node| -> Result<(), ()> {
            out.push(node.to_record());
            Ok(())
        });
        out
    }

    /// Number of leaves.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let _ = self.walk(|node| -> Result<(), ()> {
            if node.is_leaf() {
                count += 1;
            }
            Ok(())
        });
        count
    }

    /// Mutations accumulated since load or the last [`take_delta`](Self::take_delta).
    pub fn delta(&self) -> &Delta {
        &self.delta
    }

    /// Hand the accumulated delta to a persistence layer and start a fresh one.
    pub fn take_delta(&mut self) -> Delta {
        std::mem::take(&mut self.delta)
    }

    fn apply(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Write { node, replaced } => self.delta.record_write(node, replaced),
                Event::Remove(key) => self.delta.record_removal(key),
            }
        }
    }
}

impl PartialEq for Tree {
    /// Trees are equal when they commit to the same root.
    fn eq(&self, other: &Self) -> bool {
        self.root_hash() == other.root_hash()
    }
}

impl Eq for Tree {}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tree(root={})", hex::encode(self.root_hash()))
    }
}

// ---------------------------------------------------------------------------
// Recursive helpers
// ---------------------------------------------------------------------------

fn insert_at(
    node: &Arc<Node>,
    key: &[u8],
    value: &Value,
    events: &mut Vec<Event>,
    mutation: &mut Mutation,
) -> TreeResult<Arc<Node>> {
    if node.key == key {
        if !node.is_leaf() {
            return Err(TreeError::PrefixConflict(render_bits(key)));
        }
        let leaf = Node::leaf(key.to_vec(), value.clone());
        events.push(Event::Write {
            node: leaf.clone(),
            replaced: true,
        });
        *mutation = Mutation::Updated;
        return Ok(leaf);
    }

    if key.starts_with(&node.key) {
        // A leaf here would become an ancestor of the new key.
        let Some(children) = node.children() else {
            return Err(TreeError::PrefixConflict(render_bits(key)));
        };
        let bit = key[node.key.len()] as usize;
        let child = insert_at(&children[bit], key, value, events, mutation)?;
        let mut next = children.clone();
        next[bit] = child;
        let copy = Node::internal(node.key.clone(), next);
        events.push(Event::Write {
            node: copy.clone(),
            replaced: true,
        });
        return Ok(copy);
    }

    let common = common_prefix_len(key, &node.key);
    if common == key.len() {
        // The new key is a prefix of an existing subtree.
        return Err(TreeError::PrefixConflict(render_bits(key)));
    }

    let leaf = Node::leaf(key.to_vec(), value.clone());
    events.push(Event::Write {
        node: leaf.clone(),
        replaced: false,
    });
    let children = if key[common] == 0 {
        [leaf, node.clone()]
    } else {
        [node.clone(), leaf]
    };
    let parent = Node::internal(key[..common].to_vec(), children);
    events.push(Event::Write {
        node: parent.clone(),
        replaced: false,
    });
    Ok(parent)
}

/// Returns the replacement for `node`: `None` if it was removed, or the
/// same `Arc` when nothing changed.
fn delete_at(
    node: &Arc<Node>,
    key: &[u8],
    events: &mut Vec<Event>,
) -> TreeResult<Option<Arc<Node>>> {
    if node.key == key {
        if !node.is_leaf() {
            return Err(TreeError::PrefixConflict(render_bits(key)));
        }
        events.push(Event::Remove(node.key.clone()));
        return Ok(None);
    }

    if !key.starts_with(&node.key) {
        if node.key.starts_with(key) {
            return Err(TreeError::PrefixConflict(render_bits(key)));
        }
        return Ok(Some(node.clone()));
    }

    let Some(children) = node.children() else {
        return Err(TreeError::PrefixConflict(render_bits(key)));
    };
    let bit = key[node.key.len()] as usize;
    let child = &children[bit];

    match delete_at(child, key, events)? {
        None => {
            // The sibling takes this node's place.
            events.push(Event::Remove(node.key.clone()));
            Ok(Some(children[1 - bit].clone()))
        }
        Some(same) if Arc::ptr_eq(&same, child) => Ok(Some(node.clone())),
        Some(replacement) => {
            let mut next = children.clone();
            next[bit] = replacement;
            let copy = Node::internal(node.key.clone(), next);
            events.push(Event::Write {
                node: copy.clone(),
                replaced: true,
            });
            Ok(Some(copy))
        }
    }
}

fn build_from_records(records: &[(Vec<u8>, NodeRecord)], pos: &mut usize) -> TreeResult<Arc<Node>> {
    let (key, record) = records
        .get(*pos)
        .ok_or_else(|| TreeError::CorruptNodeSet("internal node is missing a child".into()))?;
    *pos += 1;

    let node = if record.is_leaf {
        let value = record.value.clone().ok_or_else(|| {
            TreeError::CorruptNodeSet(format!("leaf {} has no value", render_bits(key)))
        })?;
        Node::leaf(key.clone(), value)
    } else {
        let left = build_from_records(records, pos)?;
        let right = build_from_records(records, pos)?;
        let ok = left.key.len() > key.len()
            && right.key.len() > key.len()
            && left.key.starts_with(key)
            && right.key.starts_with(key)
            && left.key[key.len()] == 0
            && right.key[key.len()] == 1;
        if !ok {
            return Err(TreeError::CorruptNodeSet(format!(
                "children of {} do not branch on the next bit",
                render_bits(key)
            )));
        }
        Node::internal(key.clone(), [left, right])
    };

    if node.hash != record.hash {
        return Err(TreeError::CorruptNodeSet(format!(
            "hash mismatch at {}",
            render_bits(key)
        )));
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(v: &str) -> Value {
        Value::Bytes(v.as_bytes().to_vec())
    }

    fn h(v: &str) -> Hash {
        blake3_hash(v.as_bytes())
    }

    #[test]
    fn empty_tree_hashes_to_zero() {
        let tree = Tree::new();
        assert_eq!(tree.root_hash(), ZERO_HASH);
        assert!(tree.lookup(b"anything").is_none());
        assert_eq!(tree.len(), 0);
    }

    #[test]
    fn bit_expansion_is_msb_first() {
        assert_eq!(bits_from_bytes(&[0b1010_0001]), vec![1, 0, 1, 0, 0, 0, 0, 1]);
        let bits = vec![1, 1, 0, 1, 1];
        assert_eq!(unpack_bits(&pack_bits(&bits), bits.len()), Some(bits));
        assert_eq!(unpack_bits(&[0xff], 9), None);
    }

    #[test]
    fn two_keys_fork_at_common_prefix() {
        let mut tree = Tree::new();
        tree.insert(&[0b1111_1111], bytes("v1")).unwrap();
        tree.insert(&[0b1111_0000], bytes("v2")).unwrap();

        let root = tree.root().unwrap();
        assert_eq!(root.key(), &[1, 1, 1, 1]);
        let children = root.children().unwrap();
        assert_eq!(children[0].key(), &[1, 1, 1, 1, 0, 0, 0, 0]);
        assert_eq!(children[1].key(), &[1, 1, 1, 1, 1, 1, 1, 1]);
        assert!(children[0].is_leaf() && children[1].is_leaf());

        let expected = blake3_hash_multi(&[&h("v2"), &h("v1")]);
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn hash_values_are_not_rehashed() {
        let mut tree = Tree::new();
        let commitment = [9u8; 32];
        tree.insert(b"k", Value::Hash(commitment)).unwrap();
        assert_eq!(tree.root_hash(), commitment);
    }

    #[test]
    fn lookup_finds_exact_keys_only() {
        let mut tree = Tree::new();
        tree.insert(b"ab", bytes("1")).unwrap();
        tree.insert(b"ac", bytes("2")).unwrap();
        tree.insert(b"zz", bytes("3")).unwrap();

        assert_eq!(tree.lookup(b"ab"), Some(&bytes("1")));
        assert_eq!(tree.lookup(b"ac"), Some(&bytes("2")));
        assert_eq!(tree.lookup(b"zz"), Some(&bytes("3")));
        assert_eq!(tree.lookup(b"ad"), None);
        assert_eq!(tree.lookup(b"a"), None);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn reinsert_same_value_is_an_update_with_same_root() {
        let mut tree = Tree::new();
        assert_eq!(tree.insert(b"key", bytes("v")).unwrap(), Mutation::Inserted);
        tree.insert(b"other", bytes("w")).unwrap();
        let once = tree.root_hash();

        let _ = tree.take_delta();
        assert_eq!(tree.insert(b"key", bytes("v")).unwrap(), Mutation::Updated);
        assert_eq!(tree.root_hash(), once);

        let leaf_bits = bits_from_bytes(b"key");
        assert!(tree.delta().is_updated(&leaf_bits));
        assert!(!tree.delta().is_inserted(&leaf_bits));
    }

    #[test]
    fn prefix_conflicts_fail_and_leave_tree_unchanged() {
        let mut tree = Tree::new();
        tree.insert(b"abc", bytes("1")).unwrap();
        tree.insert(b"abd", bytes("2")).unwrap();
        let before = tree.root_hash();
        let delta_before = tree.delta().inserted().count();

        // New key extends an existing leaf.
        assert!(matches!(
            tree.insert(b"abcd", bytes("x")),
            Err(TreeError::PrefixConflict(_))
        ));
        // New key is a strict prefix of existing leaves.
        assert!(matches!(
            tree.insert(b"ab", bytes("x")),
            Err(TreeError::PrefixConflict(_))
        ));
        assert!(matches!(tree.delete(b"abcd"), Err(TreeError::PrefixConflict(_))));
        assert!(matches!(tree.delete(b"ab"), Err(TreeError::PrefixConflict(_))));

        assert_eq!(tree.root_hash(), before);
        assert_eq!(tree.delta().inserted().count(), delta_before);
        assert_eq!(tree.lookup(b"abc"), Some(&bytes("1")));
    }

    #[test]
    fn delete_collapses_sibling_into_parent() {
        let mut tree = Tree::new();
        tree.insert(&[0b1111_1111], bytes("v1")).unwrap();
        tree.insert(&[0b1111_0000], bytes("v2")).unwrap();
        tree.delete(&[0b1111_0000]).unwrap();

        let root = tree.root().unwrap();
        assert!(root.is_leaf());
        assert_eq!(root.key(), &[1, 1, 1, 1, 1, 1, 1, 1]);
        assert_eq!(tree.root_hash(), h("v1"));

        tree.delete(&[0b1111_1111]).unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root_hash(), ZERO_HASH);
    }

    #[test]
    fn delete_absent_key_is_noop() {
        let mut tree = Tree::new();
        tree.insert(b"aa", bytes("1")).unwrap();
        tree.insert(b"ab", bytes("2")).unwrap();
        let before = tree.root_hash();
        let _ = tree.take_delta();

        tree.delete(b"zz").unwrap();
        assert_eq!(tree.root_hash(), before);
        assert!(tree.delta().is_empty());

        let mut empty = Tree::new();
        empty.delete(b"zz").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn old_roots_survive_mutation() {
        let mut tree = Tree::new();
        tree.insert(b"k1", bytes("a")).unwrap();
        tree.insert(b"k2", bytes("b")).unwrap();
        let snapshot = tree.clone();
        let snapshot_hash = snapshot.root_hash();

        tree.insert(b"k3", bytes("c")).unwrap();
        tree.insert(b"k1", bytes("changed")).unwrap();
        tree.delete(b"k2").unwrap();

        assert_eq!(snapshot.root_hash(), snapshot_hash);
        assert_eq!(snapshot.lookup(b"k1"), Some(&bytes("a")));
        assert_eq!(snapshot.lookup(b"k2"), Some(&bytes("b")));
        assert_eq!(snapshot.lookup(b"k3"), None);
        assert_ne!(tree.root_hash(), snapshot_hash);
    }

    #[test]
    fn root_hash_is_order_independent() {
        let keys: Vec<[u8; 2]> = (0u8..40).map(|i| [i.wrapping_mul(37), i]).collect();

        let mut forward = Tree::new();
        for k in &keys {
            forward.insert(k, Value::Bytes(k.to_vec())).unwrap();
        }
        let mut backward = Tree::new();
        for k in keys.iter().rev() {
            backward.insert(k, Value::Bytes(k.to_vec())).unwrap();
        }
        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn walk_is_preorder() {
        let mut tree = Tree::new();
        tree.insert(&[0b0000_0000], bytes("a")).unwrap();
        tree.insert(&[0b1000_0000], bytes("b")).unwrap();
        tree.insert(&[0b1100_0000], bytes("c")).unwrap();

        let mut keys = Vec::new();
        tree.walk(|n| -> Result<(), ()> {
            keys.push(n.key().to_vec());
            Ok(())
        })
        .unwrap();

        assert_eq!(keys.len(), 5);
        assert!(keys[0].is_empty());
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "pre-order visits keys in sorted order");
        }
    }

    #[test]
    fn from_nodes_reproduces_topology_and_hash() {
        let mut tree = Tree::new();
        for i in 0u8..25 {
            tree.insert(&[i, i.wrapping_mul(7)], Value::Bytes(vec![i])).unwrap();
        }
        tree.insert(b"hh", Value::Hash([4u8; 32])).unwrap();

        let mut records = tree.records();
        records.reverse();
        let rebuilt = Tree::from_nodes(records).unwrap();

        assert_eq!(rebuilt.root_hash(), tree.root_hash());
        assert_eq!(rebuilt.records(), tree.records());
        assert!(rebuilt.delta().is_empty());
        assert_eq!(rebuilt.lookup(b"hh"), Some(&Value::Hash([4u8; 32])));
    }

    #[test]
    fn from_nodes_rejects_tampering() {
        let mut tree = Tree::new();
        tree.insert(b"a", bytes("1")).unwrap();
        tree.insert(b"b", bytes("2")).unwrap();

        let mut records = tree.records();
        let leaf = records.iter_mut().find(|r| r.is_leaf).unwrap();
        leaf.value = Some(bytes("forged"));
        assert!(matches!(
            Tree::from_nodes(records),
            Err(TreeError::CorruptNodeSet(_))
        ));

        let mut records = tree.records();
        records.pop();
        assert!(Tree::from_nodes(records).is_err());
    }

    #[test]
    fn delta_tracks_inserts_updates_and_deletes() {
        let mut base = Tree::new();
        base.insert(b"a", bytes("1")).unwrap();
        base.insert(b"b", bytes("2")).unwrap();
        let mut tree = Tree::from_nodes(base.records()).unwrap();

        tree.insert(b"c", bytes("3")).unwrap();
        let c = bits_from_bytes(b"c");
        assert!(tree.delta().is_inserted(&c));

        tree.insert(b"a", bytes("1'")).unwrap();
        let a = bits_from_bytes(b"a");
        assert!(tree.delta().is_updated(&a));

        tree.delete(b"b").unwrap();
        let b = bits_from_bytes(b"b");
        assert!(tree.delta().is_deleted(&b));

        // A key inserted and deleted within the session leaves no trace.
        tree.delete(b"c").unwrap();
        assert!(!tree.delta().is_inserted(&c));
        assert!(!tree.delta().is_deleted(&c));
    }

    #[test]
    fn reinsert_after_delete_is_an_update() {
        let mut base = Tree::new();
        base.insert(b"a", bytes("1")).unwrap();
        base.insert(b"b", bytes("2")).unwrap();
        let mut tree = Tree::from_nodes(base.records()).unwrap();

        tree.delete(b"b").unwrap();
        tree.insert(b"b", bytes("2")).unwrap();

        let b = bits_from_bytes(b"b");
        assert!(tree.delta().is_updated(&b));
        assert!(!tree.delta().is_inserted(&b));
        assert!(!tree.delta().is_deleted(&b));
        assert_eq!(tree.root_hash(), base.root_hash());
    }

    // -- random operation sequences -----------------------------------------

    use proptest::prelude::*;
    use std::collections::BTreeMap as Model;

    #[derive(Clone, Debug)]
    enum Op {
        Insert(Vec<u8>, Vec<u8>),
        Delete(Vec<u8>),
    }

    /// Short keys over a tiny alphabet, so repeats and prefixes are common.
    fn short_key() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(0u8..3, 1..4)
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (short_key(), prop::collection::vec(any::<u8>(), 0..8))
                .prop_map(|(k, v)| Op::Insert(k, v)),
            1 => short_key().prop_map(Op::Delete),
        ]
    }

    /// Whole-byte keys: a bit prefix is a byte prefix.
    fn in_prefix_relation(model: &Model<Vec<u8>, Vec<u8>>, key: &[u8]) -> bool {
        model
            .keys()
            .any(|k| k.as_slice() != key && (k.starts_with(key) || key.starts_with(k)))
    }

    proptest! {
        #[test]
        fn random_ops_match_model_and_leave_old_roots_intact(
            ops in prop::collection::vec(op(), 1..60)
        ) {
            let mut tree = Tree::new();
            let mut model: Model<Vec<u8>, Vec<u8>> = Model::new();

            for op in ops {
                let before = tree.clone();
                let before_records = before.records();
                let before_model = model.clone();

                let (key, result) = match &op {
                    Op::Insert(k, v) => (k, tree.insert(k, Value::Bytes(v.clone())).map(|_| ())),
                    Op::Delete(k) => (k, tree.delete(k)),
                };

                if in_prefix_relation(&before_model, key) {
                    prop_assert!(matches!(result, Err(TreeError::PrefixConflict(_))));
                    prop_assert_eq!(tree.root_hash(), before.root_hash());
                    prop_assert_eq!(tree.records(), before_records.clone());
                } else {
                    prop_assert!(result.is_ok());
                    match op {
                        Op::Insert(k, v) => {
                            model.insert(k, v);
                        }
                        Op::Delete(k) => {
                            model.remove(&k);
                        }
                    }
                }

                prop_assert_eq!(before.records(), before_records);
                for (k, v) in &before_model {
                    prop_assert_eq!(before.lookup(k), Some(&Value::Bytes(v.clone())));
                }
                for (k, v) in &model {
                    prop_assert_eq!(tree.lookup(k), Some(&Value::Bytes(v.clone())));
                }
                prop_assert_eq!(tree.len(), model.len());
            }

            let mut canonical = Tree::new();
            for (k, v) in &model {
                canonical.insert(k, Value::Bytes(v.clone())).unwrap();
            }
            prop_assert_eq!(canonical.root_hash(), tree.root_hash());

            let rebuilt = Tree::from_nodes(tree.records()).unwrap();
            prop_assert_eq!(rebuilt.root_hash(), tree.root_hash());
            prop_assert_eq!(rebuilt.records(), tree.records());
        }

        #[test]
        fn repeated_insert_is_an_update_with_same_root(
            keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 4), 1..20),
            pick in any::<prop::sample::Index>(),
        ) {
            let keys: Vec<Vec<u8>> = keys.into_iter().collect();
            let mut tree = Tree::new();
            for k in &keys {
                prop_assert_eq!(tree.insert(k, Value::Bytes(k.clone())).unwrap(), Mutation::Inserted);
            }
            let once = tree.root_hash();
            let _ = tree.take_delta();

            let key = pick.get(&keys);
            prop_assert_eq!(tree.insert(key, Value::Bytes(key.clone())).unwrap(), Mutation::Updated);
            prop_assert_eq!(tree.root_hash(), once);
            let bits = bits_from_bytes(key);
            prop_assert!(tree.delta().is_updated(&bits));
            prop_assert!(!tree.delta().is_inserted(&bits));
        }
    }
}
