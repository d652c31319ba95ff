//! Node-document storage.
//!
//! The tenant hash tree is persisted as one small JSON document per
//! `(tenant, layer, prefix)`, plus a top-level tenants document mapping each
//! tenant name to its current root hash. Documents live in memory and are
//! written through to disk when the store was opened with a data directory.
//!
//! All mutation happens on the worker actor thread, so readers and writers
//! of a given document never race; the mutexes below only make the handle
//! cheaply cloneable across tasks.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;

use crate::tree::{Node, TreeHash};

type NodeKey = (String, usize, String);

/// Handle to the node-document store.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: Option<PathBuf>,
    nodes: Mutex<HashMap<NodeKey, Node>>,
    tenants: Mutex<BTreeMap<String, TreeHash>>,
}

impl Store {
    /// An in-memory store, used by tests and diskless runs.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(Inner {
                root: None,
                nodes: Mutex::new(HashMap::new()),
                tenants: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Open a store rooted at `root`, loading the tenants document if one
    /// was persisted by an earlier run. Node documents load lazily.
    pub fn persistent(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating data dir {}", root.display()))?;
        let tenants_path = root.join("tenants.json");
        let tenants = if tenants_path.exists() {
            let raw = std::fs::read_to_string(&tenants_path)
                .with_context(|| format!("reading {}", tenants_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", tenants_path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            inner: Arc::new(Inner {
                root: Some(root),
                nodes: Mutex::new(HashMap::new()),
                tenants: Mutex::new(tenants),
            }),
        })
    }

    fn node_path(&self, tenant: &str, layer: usize, prefix: &str) -> Option<PathBuf> {
        self.inner
            .root
            .as_ref()
            .map(|root| root.join(tenant).join(format!("{layer}_{prefix}.json")))
    }

    /// Fetch the node at `(tenant, layer, prefix)`, or an empty leaf if none
    /// has been written yet.
    pub fn node(&self, tenant: &str, layer: usize, prefix: &str) -> Result<Node> {
        let key = (tenant.to_owned(), layer, prefix.to_owned());
        if let Some(node) = self.inner.nodes.lock().get(&key) {
            return Ok(node.clone());
        }
        if let Some(path) = self.node_path(tenant, layer, prefix) {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let node: Node = serde_json::from_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?;
                self.inner.nodes.lock().insert(key, node.clone());
                return Ok(node);
            }
        }
        Ok(Node::empty_leaf())
    }

    /// Write the node at `(tenant, layer, prefix)`.
    pub fn put_node(&self, tenant: &str, layer: usize, prefix: &str, node: &Node) -> Result<()> {
        if let Some(path) = self.node_path(tenant, layer, prefix) {
            write_json(&path, node)?;
        }
        let key = (tenant.to_owned(), layer, prefix.to_owned());
        self.inner.nodes.lock().insert(key, node.clone());
        Ok(())
    }

    /// Drop the node document at `(tenant, layer, prefix)`.
    pub fn remove_node(&self, tenant: &str, layer: usize, prefix: &str) -> Result<()> {
        let key = (tenant.to_owned(), layer, prefix.to_owned());
        self.inner.nodes.lock().remove(&key);
        if let Some(path) = self.node_path(tenant, layer, prefix) {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// The recorded top-level hash for a tenant.
    pub fn tenant_hash(&self, tenant: &str) -> Option<TreeHash> {
        self.inner.tenants.lock().get(tenant).copied()
    }

    /// Record a tenant's top-level hash and persist the tenants document.
    pub fn set_tenant_hash(&self, tenant: &str, hash: TreeHash) -> Result<()> {
        let mut tenants = self.inner.tenants.lock();
        tenants.insert(tenant.to_owned(), hash);
        if let Some(root) = &self.inner.root {
            write_json(&root.join("tenants.json"), &*tenants)?;
        }
        Ok(())
    }

    /// Digest of every tenant's top-level hash, in tenant-name order.
    ///
    /// This is the hash a node identifies itself by across the fleet.
    pub fn server_identity(&self) -> TreeHash {
        let tenants = self.inner.tenants.lock();
        TreeHash::rollup(
            tenants
                .iter()
                .flat_map(|(name, hash)| [name.as_bytes(), &hash.0[..]]),
        )
    }
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("node document path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let raw = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
