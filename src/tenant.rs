//! Tenants: the named filesystem subtrees a node synchronizes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::TenantConfig;
use crate::store::Store;
use crate::tree::Tree;

/// A change observed under a tenant root, as delivered by the filesystem
/// watcher collaborator or the startup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// A tenant known to this node.
///
/// A subscribed tenant mirrors content under its local root; an
/// unsubscribed one only takes part in server-identity hashing.
#[derive(Debug)]
pub struct Tenant {
    pub name: String,
    /// Local root of the tenant's subtree.
    pub root: PathBuf,
    pub subscription: Option<Subscription>,
}

/// The active mirror of a tenant, holding its hash tree.
#[derive(Debug)]
pub struct Subscription {
    pub tree: Tree,
}

impl Tenant {
    pub fn from_config(name: &str, config: &TenantConfig, store: &Store) -> Tenant {
        let subscription = config.subscribe.then(|| Subscription {
            tree: Tree::new(name.to_owned(), store.clone()),
        });
        Tenant {
            name: name.to_owned(),
            root: config.path.clone(),
            subscription,
        }
    }

    /// The absolute path of an inode name within this tenant.
    pub fn local_path(&self, name: &str) -> PathBuf {
        self.root.join(Path::new(name))
    }
}

/// The tenants this node knows about.
#[derive(Debug, Default)]
pub struct Tenants {
    map: BTreeMap<String, Arc<Tenant>>,
}

impl Tenants {
    pub fn from_config(configs: &BTreeMap<String, TenantConfig>, store: &Store) -> Tenants {
        let map = configs
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    Arc::new(Tenant::from_config(name, config, store)),
                )
            })
            .collect();
        Tenants { map }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Tenant>> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Tenant>> {
        self.map.values()
    }
}
