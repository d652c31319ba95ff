//! The tenant hash tree.
//!
//! Each tenant's inodes live in a prefix tree keyed by the base32 digits of
//! the SHA-256 of the inode name. Layer `L` of the tree is indexed by the
//! first `L` digits. A node is either a leaf holding inode records directly
//! or a partitioned node holding up to 32 child rollup hashes, one per next
//! digit. A leaf splits once it holds more than [`LEAF_CAPACITY`] records
//! and a partitioned subtree collapses back into a leaf once it fits again,
//! so the shape of the tree is a function of the inode set alone and two
//! replicas holding the same records always agree on every rollup hash.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use data_encoding::{BASE32_NOPAD, HEXLOWER};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::Store;
use crate::tick::Tick;

/// Inodes a leaf holds before it is split into a partitioned node.
pub const LEAF_CAPACITY: usize = 64;

/// Fan-out of a partitioned node, one slot per base32 digit.
pub const FANOUT: usize = 32;

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// A 32-byte rollup or content digest, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash(pub [u8; 32]);

impl TreeHash {
    /// Digest a sequence of byte slices in order.
    pub fn rollup<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> TreeHash {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        TreeHash(hasher.finalize().into())
    }

    /// The hash of an empty subtree.
    pub fn empty() -> TreeHash {
        TreeHash::rollup([])
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", &HEXLOWER.encode(&self.0)[..12])
    }
}

impl Serialize for TreeHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&HEXLOWER.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for TreeHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = HEXLOWER
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))?;
        Ok(TreeHash(digest))
    }
}

/// The base32 digit string an inode name maps to within the tree.
pub fn name_hash(name: &str) -> String {
    BASE32_NOPAD.encode(&Sha256::digest(name.as_bytes()))
}

/// Index of a base32 digit within the alphabet.
pub fn digit_index(digit: char) -> Option<usize> {
    ALPHABET.iter().position(|&c| c as char == digit)
}

/// The base32 digit for an alphabet index.
pub fn digit_char(index: usize) -> char {
    ALPHABET[index] as char
}

/// What an inode record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    Directory,
    File,
    MoveOut,
}

/// Size and mtime of a file inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: SizeBytes,
    /// Microseconds since the unix epoch.
    pub modified: i64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeBytes {
    pub bytes: u64,
}

impl FileStat {
    pub fn new(bytes: u64, modified: i64) -> Self {
        Self {
            size: SizeBytes { bytes },
            modified,
        }
    }
}

/// Hashes attached to an inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeHash {
    /// Content hash identifying this inode's subtree.
    pub inode: TreeHash,
}

/// One file, directory or move-out marker within a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    /// Path relative to the tenant root.
    pub name: String,
    pub filetype: FileType,
    /// Tick of the last logical change.
    pub priority: Tick,
    pub hash: InodeHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<FileStat>,
}

impl Inode {
    /// Build a record, deriving the inode hash from its fields.
    pub fn new(name: String, filetype: FileType, priority: Tick, stat: Option<FileStat>) -> Self {
        let mut inode = Inode {
            name,
            filetype,
            priority,
            hash: InodeHash {
                inode: TreeHash::empty(),
            },
            stat,
        };
        inode.hash.inode = inode.derive_hash();
        inode
    }

    /// Digest over the record's identifying fields.
    ///
    /// A separately computed content hash (FILE-HASH exchange) may replace
    /// this later without touching the priority.
    pub fn derive_hash(&self) -> TreeHash {
        let tag: u8 = match self.filetype {
            FileType::Directory => 1,
            FileType::File => 2,
            FileType::MoveOut => 3,
        };
        let time = self.priority.time.to_be_bytes();
        let server = self.priority.server.to_be_bytes();
        let size = self
            .stat
            .map(|s| s.size.bytes.to_be_bytes())
            .unwrap_or_default();
        TreeHash::rollup([
            &[tag][..],
            self.name.as_bytes(),
            &time,
            &server,
            &size,
        ])
    }
}

/// A node document within a tenant's tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    /// Interior node: child rollup hashes keyed by their base32 digit.
    Partitioned { children: BTreeMap<String, TreeHash> },
    /// Leaf node: inode records sharing this node's prefix.
    Leaf { inodes: Vec<Inode> },
}

impl Node {
    pub fn empty_leaf() -> Node {
        Node::Leaf { inodes: Vec::new() }
    }

    pub fn is_partitioned(&self) -> bool {
        matches!(self, Node::Partitioned { .. })
    }

    /// Rollup hash of this node.
    ///
    /// Leaves digest their inode hashes in ascending name-hash order (the
    /// order they are stored in); partitioned nodes digest their child
    /// hashes in ascending digit order.
    pub fn hash(&self) -> TreeHash {
        match self {
            Node::Leaf { inodes } => {
                TreeHash::rollup(inodes.iter().map(|inode| &inode.hash.inode.0[..]))
            }
            Node::Partitioned { children } => {
                TreeHash::rollup(children.values().map(|hash| &hash.0[..]))
            }
        }
    }

    /// Child hashes as a fixed 32-slot array, for the TENANT-HASH packet.
    pub fn children_array(&self) -> [Option<TreeHash>; FANOUT] {
        let mut slots = [None; FANOUT];
        if let Node::Partitioned { children } = self {
            for (digit, hash) in children {
                if let Some(index) = digit.chars().next().and_then(digit_index) {
                    slots[index] = Some(*hash);
                }
            }
        }
        slots
    }
}

/// A tenant's view of the hash tree, bound to the document store.
///
/// Only the worker actor calls the mutating methods, which is what keeps
/// document updates transactional.
#[derive(Debug, Clone)]
pub struct Tree {
    tenant: String,
    store: Store,
}

impl Tree {
    pub fn new(tenant: String, store: Store) -> Self {
        Self { tenant, store }
    }

    /// The node at `(layer, prefix)`, or an empty leaf.
    pub fn layer_node(&self, layer: usize, prefix: &str) -> Result<Node> {
        self.store.node(&self.tenant, layer, prefix)
    }

    /// Current root hash of the tenant.
    pub fn root_hash(&self) -> Result<TreeHash> {
        Ok(self.layer_node(0, "")?.hash())
    }

    /// Find the record for `name`, if any.
    pub fn lookup(&self, name: &str) -> Result<Option<Inode>> {
        let digits = name_hash(name);
        let (_, _, node) = self.descend(&digits)?;
        match node {
            Node::Leaf { inodes } => Ok(inodes.into_iter().find(|inode| inode.name == name)),
            Node::Partitioned { .. } => bail!("descend ended on a partitioned node"),
        }
    }

    /// Insert or replace a record, rehashing up to the tenant root.
    pub fn insert(&self, inode: Inode) -> Result<()> {
        let digits = name_hash(&inode.name);
        let (layer, prefix, node) = self.descend(&digits)?;
        let Node::Leaf { mut inodes } = node else {
            bail!("descend ended on a partitioned node");
        };
        match inodes.iter_mut().find(|existing| existing.name == inode.name) {
            Some(existing) => *existing = inode,
            None => {
                inodes.push(inode);
                inodes.sort_by_key(|inode| name_hash(&inode.name));
            }
        }
        if inodes.len() > LEAF_CAPACITY {
            self.split(layer, &prefix, inodes)?;
        } else {
            self.store
                .put_node(&self.tenant, layer, &prefix, &Node::Leaf { inodes })?;
        }
        self.rehash_upward(layer, prefix)
    }

    /// Remove the record for `name`, rehashing up to the tenant root.
    ///
    /// Subtrees that fit within a single leaf again are collapsed, so the
    /// root hash returns to what it was before the record was inserted.
    pub fn remove(&self, name: &str) -> Result<Option<Inode>> {
        let digits = name_hash(name);
        let (mut layer, mut prefix, node) = self.descend(&digits)?;
        let Node::Leaf { mut inodes } = node else {
            bail!("descend ended on a partitioned node");
        };
        let position = inodes.iter().position(|inode| inode.name == name);
        let Some(position) = position else {
            return Ok(None);
        };
        let removed = inodes.remove(position);
        self.store
            .put_node(&self.tenant, layer, &prefix, &Node::Leaf { inodes })?;

        // Collapse ancestors whose subtree fits in one leaf again.
        while layer > 0 {
            let parent_prefix: String = prefix.chars().take(layer - 1).collect();
            let gathered = self.collect_subtree(layer - 1, &parent_prefix)?;
            if gathered.len() > LEAF_CAPACITY {
                break;
            }
            self.remove_children(layer - 1, &parent_prefix)?;
            self.store.put_node(
                &self.tenant,
                layer - 1,
                &parent_prefix,
                &Node::Leaf { inodes: gathered },
            )?;
            layer -= 1;
            prefix = parent_prefix;
        }
        self.rehash_upward(layer, prefix)?;
        Ok(Some(removed))
    }

    /// All records below `(layer, prefix)` in ascending name-hash order.
    pub fn collect_subtree(&self, layer: usize, prefix: &str) -> Result<Vec<Inode>> {
        match self.store.node(&self.tenant, layer, prefix)? {
            Node::Leaf { inodes } => Ok(inodes),
            Node::Partitioned { children } => {
                let mut gathered = Vec::new();
                for digit in children.keys() {
                    let child_prefix = format!("{prefix}{digit}");
                    gathered.extend(self.collect_subtree(layer + 1, &child_prefix)?);
                }
                Ok(gathered)
            }
        }
    }

    /// Walk from the root to the leaf a name hash lands in.
    fn descend(&self, digits: &str) -> Result<(usize, String, Node)> {
        let mut layer = 0;
        let mut prefix = String::new();
        loop {
            let node = self.store.node(&self.tenant, layer, &prefix)?;
            if !node.is_partitioned() {
                return Ok((layer, prefix, node));
            }
            let Some(digit) = digits.chars().nth(layer) else {
                bail!("name hash {digits:?} shorter than tree depth {layer}");
            };
            prefix.push(digit);
            layer += 1;
        }
    }

    /// Replace an over-full leaf with a partitioned node of child leaves.
    fn split(&self, layer: usize, prefix: &str, inodes: Vec<Inode>) -> Result<()> {
        let mut buckets: BTreeMap<String, Vec<Inode>> = BTreeMap::new();
        for inode in inodes {
            let digits = name_hash(&inode.name);
            let Some(digit) = digits.chars().nth(layer) else {
                bail!("name hash {digits:?} shorter than split layer {layer}");
            };
            buckets.entry(digit.to_string()).or_default().push(inode);
        }
        let mut children = BTreeMap::new();
        for (digit, bucket) in buckets {
            let child_prefix = format!("{prefix}{digit}");
            let child = if bucket.len() > LEAF_CAPACITY {
                self.split(layer + 1, &child_prefix, bucket)?;
                self.store.node(&self.tenant, layer + 1, &child_prefix)?
            } else {
                let child = Node::Leaf { inodes: bucket };
                self.store
                    .put_node(&self.tenant, layer + 1, &child_prefix, &child)?;
                child
            };
            children.insert(digit, child.hash());
        }
        self.store
            .put_node(&self.tenant, layer, prefix, &Node::Partitioned { children })
    }

    /// Delete every node document strictly below `(layer, prefix)`.
    fn remove_children(&self, layer: usize, prefix: &str) -> Result<()> {
        if let Node::Partitioned { children } = self.store.node(&self.tenant, layer, prefix)? {
            for digit in children.keys() {
                let child_prefix = format!("{prefix}{digit}");
                self.remove_children(layer + 1, &child_prefix)?;
                self.store
                    .remove_node(&self.tenant, layer + 1, &child_prefix)?;
            }
        }
        Ok(())
    }

    /// Recompute rollup hashes from `(layer, prefix)` to the root, then
    /// record the tenant's top-level hash.
    ///
    /// A leaf emptied along the way is dropped from its parent entirely, so
    /// a digit that holds no records contributes nothing to the rollup.
    fn rehash_upward(&self, mut layer: usize, mut prefix: String) -> Result<()> {
        loop {
            let node = self.store.node(&self.tenant, layer, &prefix)?;
            let empty = matches!(&node, Node::Leaf { inodes } if inodes.is_empty());
            let hash = node.hash();
            if layer == 0 {
                return self.store.set_tenant_hash(&self.tenant, hash);
            }
            let digit = prefix
                .chars()
                .nth(layer - 1)
                .expect("prefix length matches layer")
                .to_string();
            let parent_prefix: String = prefix.chars().take(layer - 1).collect();
            let parent = self.store.node(&self.tenant, layer - 1, &parent_prefix)?;
            let Node::Partitioned { mut children } = parent else {
                bail!("parent of a populated child is not partitioned");
            };
            if empty {
                children.remove(&digit);
                self.store.remove_node(&self.tenant, layer, &prefix)?;
            } else {
                children.insert(digit, hash);
            }
            self.store
                .put_node(&self.tenant, layer - 1, &parent_prefix, &Node::Partitioned { children })?;
            layer -= 1;
            prefix = parent_prefix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Tree {
        Tree::new("t".to_owned(), Store::memory())
    }

    fn dir(name: &str, time: i64) -> Inode {
        Inode::new(
            name.to_owned(),
            FileType::Directory,
            Tick { time, server: 1 },
            None,
        )
    }

    #[test]
    fn empty_root_is_the_empty_digest() {
        assert_eq!(tree().root_hash().unwrap(), TreeHash::empty());
    }

    #[test]
    fn insert_then_remove_restores_the_root() {
        let tree = tree();
        tree.insert(dir("a", 1)).unwrap();
        tree.insert(dir("b", 2)).unwrap();
        let before = tree.root_hash().unwrap();

        tree.insert(dir("c", 3)).unwrap();
        assert_ne!(tree.root_hash().unwrap(), before);

        tree.remove("c").unwrap().unwrap();
        assert_eq!(tree.root_hash().unwrap(), before);
    }

    #[test]
    fn insert_then_remove_across_a_split_restores_the_root() {
        let tree = tree();
        for i in 0..LEAF_CAPACITY {
            tree.insert(dir(&format!("inode-{i}"), i as i64)).unwrap();
        }
        assert!(!tree.layer_node(0, "").unwrap().is_partitioned());
        let before = tree.root_hash().unwrap();

        tree.insert(dir("straw", 99)).unwrap();
        assert!(tree.layer_node(0, "").unwrap().is_partitioned());

        tree.remove("straw").unwrap().unwrap();
        assert!(!tree.layer_node(0, "").unwrap().is_partitioned());
        assert_eq!(tree.root_hash().unwrap(), before);
    }

    #[test]
    fn identical_sets_agree_on_the_root_hash() {
        let a = tree();
        let b = tree();
        for i in 0..100 {
            a.insert(dir(&format!("inode-{i}"), i)).unwrap();
        }
        for i in (0..100).rev() {
            b.insert(dir(&format!("inode-{i}"), i)).unwrap();
        }
        assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());
    }

    #[test]
    fn lookup_finds_the_latest_record() {
        let tree = tree();
        tree.insert(dir("a", 1)).unwrap();
        tree.insert(dir("a", 5)).unwrap();
        let found = tree.lookup("a").unwrap().unwrap();
        assert_eq!(found.priority.time, 5);
        assert!(tree.lookup("missing").unwrap().is_none());
    }

    #[test]
    fn split_keeps_every_record_reachable() {
        let tree = tree();
        for i in 0..200 {
            tree.insert(dir(&format!("inode-{i}"), i)).unwrap();
        }
        for i in 0..200 {
            let name = format!("inode-{i}");
            assert!(tree.lookup(&name).unwrap().is_some(), "{name} lost");
        }
        let gathered = tree.collect_subtree(0, "").unwrap();
        assert_eq!(gathered.len(), 200);
    }

    #[test]
    fn children_array_matches_digit_slots() {
        let tree = tree();
        for i in 0..200 {
            tree.insert(dir(&format!("inode-{i}"), i)).unwrap();
        }
        let root = tree.layer_node(0, "").unwrap();
        let slots = root.children_array();
        let Node::Partitioned { children } = &root else {
            panic!("expected a split root");
        };
        assert_eq!(
            slots.iter().filter(|slot| slot.is_some()).count(),
            children.len()
        );
        for (digit, hash) in children {
            let index = digit_index(digit.chars().next().unwrap()).unwrap();
            assert_eq!(slots[index], Some(*hash));
        }
    }
}
