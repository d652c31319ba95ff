//! The worker actor.
//!
//! All filesystem, node-document and hash work runs on one dedicated thread
//! so a connection's reader task never blocks on disk. Handlers post typed
//! [`Action`]s; the actor owns the tenants, the document store and every
//! mutation of both, which is what makes node-document updates transactional.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use iroh_metrics::inc;
use tokio::sync::oneshot;
use tracing::{debug, error, error_span, info, warn};

use crate::fsops;
use crate::metrics::Metrics;
use crate::net::handlers;
use crate::net::{Connection, Registry};
use crate::proto::DecodeError;
use crate::store::Store;
use crate::sweep;
use crate::tenant::{ChangeKind, Tenant, Tenants};
use crate::tick::Tick;
use crate::tree::{FileStat, FileType, Inode, Node, Tree, TreeHash, FANOUT};

/// Work posted to the actor thread.
#[derive(Debug)]
pub enum Action {
    /// A change observed under a tenant root by the sweep or a watcher.
    LocalChange {
        tenant: String,
        path: PathBuf,
        kind: ChangeKind,
    },
    /// A freshly computed content hash for a local file.
    LocalFileHash {
        tenant: String,
        name: String,
        hash: TreeHash,
    },
    /// Send our tenant advertisements to a peer that proved its identity.
    Advertise { conn: Arc<Connection> },
    /// A peer advertised a tenant's top-level hash.
    TenantAdvertised {
        conn: Arc<Connection>,
        name: String,
        hash: TreeHash,
    },
    /// A peer sent a layer of child hashes to compare against.
    TenantHashes {
        conn: Arc<Connection>,
        name: String,
        prefix: String,
        hashes: Box<[Option<TreeHash>; FANOUT]>,
    },
    /// A peer told us a directory exists.
    RemoteDirectory {
        tenant: String,
        name: String,
        priority: Tick,
    },
    /// A peer told us a file exists with the given stat.
    RemoteFile {
        tenant: String,
        name: String,
        priority: Tick,
        stat: FileStat,
    },
    /// A peer moved an inode out.
    RemoteMoveOut {
        tenant: String,
        name: String,
        priority: Tick,
    },
    /// A peer sent a content hash for a file that has no priority yet.
    RemoteFileHash {
        tenant: String,
        name: String,
        hash: TreeHash,
    },
    /// A peer sent a block of file content.
    RemoteFileData {
        tenant: String,
        name: String,
        offset: u64,
        data: Bytes,
    },
    /// Report a tenant's current root hash.
    RootHash {
        tenant: String,
        reply: oneshot::Sender<Result<TreeHash>>,
    },
    /// Report the record for one inode.
    GetInode {
        tenant: String,
        name: String,
        reply: oneshot::Sender<Result<Option<Inode>>>,
    },
    /// Report the digest this server identifies as across the fleet.
    ServerIdentity { reply: oneshot::Sender<TreeHash> },
    /// Drain and stop the actor.
    Shutdown,
}

/// Handle to the worker actor thread.
#[derive(Debug, Clone)]
pub struct ActorHandle {
    tx: flume::Sender<Action>,
}

impl ActorHandle {
    /// Spawn the actor and sweep every subscribed tenant.
    pub fn spawn(server: u32, tenants: Tenants, store: Store, registry: Registry) -> ActorHandle {
        let (tx, rx) = flume::unbounded();
        let mut actor = Actor {
            server,
            tenants,
            store,
            registry,
            rx,
        };
        std::thread::spawn(move || {
            let span = error_span!("worker", server = actor.server);
            let _enter = span.enter();
            actor.sweep_all();
            actor.run();
        });
        ActorHandle { tx }
    }

    /// Post an action.
    pub async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .map_err(|_| anyhow!("worker actor is gone"))
    }

    /// A tenant's current root hash.
    pub async fn root_hash(&self, tenant: &str) -> Result<TreeHash> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::RootHash {
            tenant: tenant.to_owned(),
            reply,
        })
        .await?;
        rx.await?
    }

    /// The record for one inode, if present.
    pub async fn get_inode(&self, tenant: &str, name: &str) -> Result<Option<Inode>> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::GetInode {
            tenant: tenant.to_owned(),
            name: name.to_owned(),
            reply,
        })
        .await?;
        rx.await?
    }

    /// The rollup of every tenant's top-level hash.
    pub async fn server_identity(&self) -> Result<TreeHash> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::ServerIdentity { reply }).await?;
        Ok(rx.await?)
    }

    /// Ingest a filesystem change for a tenant.
    pub async fn local_change(&self, tenant: &str, path: PathBuf, kind: ChangeKind) -> Result<()> {
        self.send(Action::LocalChange {
            tenant: tenant.to_owned(),
            path,
            kind,
        })
        .await
    }

    /// Stop the actor once queued work has drained.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Action::Shutdown);
    }
}

struct Actor {
    server: u32,
    tenants: Tenants,
    store: Store,
    registry: Registry,
    rx: flume::Receiver<Action>,
}

impl Actor {
    fn run(&mut self) {
        loop {
            let Ok(action) = self.rx.recv() else {
                break;
            };
            let is_shutdown = matches!(action, Action::Shutdown);
            if let Err(err) = self.on_action(action) {
                error!("worker action failed: {err:#}");
            }
            if is_shutdown {
                break;
            }
        }
        debug!("worker actor stopped");
    }

    fn sweep_all(&mut self) {
        let roots: Vec<(String, PathBuf)> = self
            .tenants
            .iter()
            .filter(|tenant| tenant.subscription.is_some())
            .map(|tenant| (tenant.name.clone(), tenant.root.clone()))
            .collect();
        for (name, root) in roots {
            match sweep::scan(&root) {
                Ok(entries) => {
                    let total = entries.len();
                    for entry in entries {
                        if let Err(err) =
                            self.local_change(&name, entry.path, ChangeKind::Created)
                        {
                            warn!(tenant = %name, "sweep entry failed: {err:#}");
                        }
                    }
                    info!(tenant = %name, entries = total, "swept tenant root");
                }
                Err(err) => error!(tenant = %name, "sweep failed: {err:#}"),
            }
        }
    }

    fn on_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::LocalChange { tenant, path, kind } => {
                self.local_change(&tenant, path, kind)
            }
            Action::LocalFileHash { tenant, name, hash } => {
                self.local_file_hash(&tenant, &name, hash)
            }
            Action::Advertise { conn } => self.advertise(&conn),
            Action::TenantAdvertised { conn, name, hash } => {
                self.tenant_advertised(&conn, &name, hash)
            }
            Action::TenantHashes {
                conn,
                name,
                prefix,
                hashes,
            } => self.compare_hashes(&conn, &name, &prefix, &hashes),
            Action::RemoteDirectory {
                tenant,
                name,
                priority,
            } => self.apply_remote(&tenant, &name, FileType::Directory, priority, None),
            Action::RemoteFile {
                tenant,
                name,
                priority,
                stat,
            } => self.apply_remote(&tenant, &name, FileType::File, priority, Some(stat)),
            Action::RemoteMoveOut {
                tenant,
                name,
                priority,
            } => self.apply_remote(&tenant, &name, FileType::MoveOut, priority, None),
            Action::RemoteFileHash { tenant, name, hash } => {
                self.remote_file_hash(&tenant, &name, hash)
            }
            Action::RemoteFileData {
                tenant,
                name,
                offset,
                data,
            } => self.remote_file_data(&tenant, &name, offset, &data),
            Action::RootHash { tenant, reply } => {
                let result = self
                    .subscribed(&tenant)
                    .and_then(|(_, tree)| tree.root_hash());
                let _ = reply.send(result);
                Ok(())
            }
            Action::GetInode {
                tenant,
                name,
                reply,
            } => {
                let result = self
                    .subscribed(&tenant)
                    .and_then(|(_, tree)| tree.lookup(&name));
                let _ = reply.send(result);
                Ok(())
            }
            Action::ServerIdentity { reply } => {
                let _ = reply.send(self.store.server_identity());
                Ok(())
            }
            Action::Shutdown => Ok(()),
        }
    }

    fn tenant(&self, name: &str) -> Result<Arc<Tenant>> {
        self.tenants
            .get(name)
            .cloned()
            .with_context(|| format!("unknown tenant {name:?}"))
    }

    fn subscribed(&self, name: &str) -> Result<(Arc<Tenant>, Tree)> {
        let tenant = self.tenant(name)?;
        let Some(subscription) = &tenant.subscription else {
            return Err(anyhow!("tenant {name:?} is not subscribed"));
        };
        let tree = subscription.tree.clone();
        Ok((tenant, tree))
    }

    /// Record a local filesystem change and announce it to every peer.
    fn local_change(&mut self, tenant: &str, path: PathBuf, kind: ChangeKind) -> Result<()> {
        let (tenant, tree) = self.subscribed(tenant)?;
        let name = fsops::relative_path(&tenant.root, &path)?;
        if name.is_empty() {
            // the tenant root itself carries no record
            return Ok(());
        }
        let priority = Tick::now(self.server);
        let inode = match kind {
            ChangeKind::Created | ChangeKind::Modified => {
                if path.is_dir() {
                    Inode::new(name.clone(), FileType::Directory, priority, None)
                } else {
                    let stat = fsops::file_stat(&path)?;
                    Inode::new(name.clone(), FileType::File, priority, Some(stat))
                }
            }
            ChangeKind::Deleted | ChangeKind::Moved => {
                Inode::new(name.clone(), FileType::MoveOut, priority, None)
            }
        };
        tree.insert(inode.clone())?;
        let tenant_name = tenant.name.clone();
        self.registry.broadcast(move || match inode.filetype {
            FileType::Directory => handlers::create_directory_out(&tenant_name, &inode),
            FileType::File => handlers::file_exists_out(&tenant_name, &inode),
            FileType::MoveOut => handlers::move_out_packet(&tenant_name, &inode),
        });
        Ok(())
    }

    /// Attach a computed content hash to a local file record and announce it.
    fn local_file_hash(&mut self, tenant: &str, name: &str, hash: TreeHash) -> Result<()> {
        let (tenant, tree) = self.subscribed(tenant)?;
        let Some(mut inode) = tree.lookup(name)? else {
            debug!(name, "content hash for an unknown inode, ignoring");
            return Ok(());
        };
        inode.hash.inode = hash;
        tree.insert(inode)?;
        let tenant_name = tenant.name.clone();
        let name = name.to_owned();
        self.registry
            .broadcast(move || handlers::file_hash_out(&tenant_name, &name, &hash));
        Ok(())
    }

    /// Queue a TENANT advertisement for every subscribed tenant.
    fn advertise(&mut self, conn: &Arc<Connection>) -> Result<()> {
        for tenant in self.tenants.iter() {
            let Some(subscription) = &tenant.subscription else {
                continue;
            };
            let name = tenant.name.clone();
            let hash = subscription.tree.root_hash()?;
            conn.queue(Box::new(move || handlers::tenant_packet(&name, &hash)));
        }
        Ok(())
    }

    /// A peer advertised `hash` as its top-level hash for `name`.
    fn tenant_advertised(&mut self, conn: &Arc<Connection>, name: &str, hash: TreeHash) -> Result<()> {
        if self.tenant(name)?.subscription.is_none() {
            // We would store the hash in the tenants document so it feeds
            // the server identity hash.
            return Err(DecodeError::NotImplemented(
                "receiving a tenant packet for an unsubscribed tenant",
            )
            .into());
        }
        let (tenant, tree) = self.subscribed(name)?;
        if tree.root_hash()? == hash {
            debug!(tenant = %name, "tenant already in sync");
            return Ok(());
        }
        self.send_tenant_content(conn, &tenant, &tree, 0, "")
    }

    /// A peer sent the child hashes of its node at `prefix`.
    fn compare_hashes(
        &mut self,
        conn: &Arc<Connection>,
        name: &str,
        prefix: &str,
        peer: &[Option<TreeHash>; FANOUT],
    ) -> Result<()> {
        if self.tenant(name)?.subscription.is_none() {
            return Err(DecodeError::NotImplemented(
                "receiving tenant hashes for an unsubscribed tenant",
            )
            .into());
        }
        let (tenant, tree) = self.subscribed(name)?;
        let layer = prefix.chars().count();
        let node = tree.layer_node(layer, prefix)?;
        match &node {
            // The peer partitioned deeper than we did. Send what we hold;
            // when the peer listed subtrees, answer with an empty listing
            // so it pushes them. An empty listing gets no listing back, or
            // two bare leaves would trade empty packets forever.
            Node::Leaf { inodes } => {
                self.send_leaf_packets(conn, &tenant, inodes)?;
                if peer.iter().any(Option::is_some) {
                    let name = tenant.name.clone();
                    let prefix = prefix.to_owned();
                    conn.queue(Box::new(move || {
                        handlers::tenant_hash_packet(&name, &prefix, &[None; FANOUT])
                    }));
                }
                Ok(())
            }
            Node::Partitioned { .. } => {
                let local = node.children_array();
                for index in 0..FANOUT {
                    let digit = crate::tree::digit_char(index);
                    let child_prefix = format!("{prefix}{digit}");
                    match (local[index], peer[index]) {
                        // our side of a diverged subtree
                        (Some(ours), theirs) if theirs != Some(ours) => {
                            self.send_tenant_content(conn, &tenant, &tree, layer + 1, &child_prefix)?;
                        }
                        // nothing local under a digit the peer holds; an
                        // empty listing asks the peer to push it
                        (None, Some(_)) => {
                            let name = tenant.name.clone();
                            conn.queue(Box::new(move || {
                                handlers::tenant_hash_packet(&name, &child_prefix, &[None; FANOUT])
                            }));
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
        }
    }

    /// Queue the reconciliation response for our node at `(layer, prefix)`:
    /// a TENANT-HASH packet when partitioned, leaf packets otherwise.
    fn send_tenant_content(
        &self,
        conn: &Arc<Connection>,
        tenant: &Arc<Tenant>,
        tree: &Tree,
        layer: usize,
        prefix: &str,
    ) -> Result<()> {
        let node = tree.layer_node(layer, prefix)?;
        match &node {
            Node::Partitioned { .. } => {
                let name = tenant.name.clone();
                let prefix = prefix.to_owned();
                let children = node.children_array();
                conn.queue(Box::new(move || {
                    handlers::tenant_hash_packet(&name, &prefix, &children)
                }));
                Ok(())
            }
            Node::Leaf { inodes } => self.send_leaf_packets(conn, tenant, inodes),
        }
    }

    fn send_leaf_packets(
        &self,
        conn: &Arc<Connection>,
        tenant: &Arc<Tenant>,
        inodes: &[Inode],
    ) -> Result<()> {
        for inode in inodes {
            let tenant_name = tenant.name.clone();
            let inode = inode.clone();
            conn.queue(Box::new(move || match inode.filetype {
                FileType::Directory => handlers::create_directory_out(&tenant_name, &inode),
                FileType::File => handlers::file_exists_out(&tenant_name, &inode),
                FileType::MoveOut => handlers::move_out_packet(&tenant_name, &inode),
            }));
        }
        Ok(())
    }

    /// Apply a peer's inode, last-writer-wins by tick.
    ///
    /// Only a strictly greater incoming tick overwrites local state; an
    /// equal tick leaves it unchanged, which makes the tie-break stable
    /// across the fleet.
    fn apply_remote(
        &mut self,
        tenant: &str,
        name: &str,
        filetype: FileType,
        priority: Tick,
        stat: Option<FileStat>,
    ) -> Result<()> {
        let (tenant, tree) = match self.subscribed(tenant) {
            Ok(subscribed) => subscribed,
            Err(err) => {
                warn!("dropping remote inode: {err:#}");
                return Ok(());
            }
        };
        if let Some(existing) = tree.lookup(name)? {
            if existing.priority >= priority {
                inc!(Metrics, inodes_ignored_stale);
                return Ok(());
            }
        }
        let location = tenant.local_path(name);
        match filetype {
            FileType::Directory => {
                std::fs::create_dir_all(&location)
                    .with_context(|| format!("creating {}", location.display()))?;
                inc!(Metrics, inodes_applied_directory);
            }
            FileType::File => {
                if let Some(parent) = location.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let size = stat.map(|s| s.size.bytes).unwrap_or_default();
                fsops::allocate_file(&location, size)?;
                inc!(Metrics, inodes_applied_file);
            }
            FileType::MoveOut => {
                remove_location(&location);
                inc!(Metrics, inodes_applied_move_out);
            }
        }
        tree.insert(Inode::new(name.to_owned(), filetype, priority, stat))?;
        Ok(())
    }

    fn remote_file_hash(&mut self, tenant: &str, name: &str, hash: TreeHash) -> Result<()> {
        let (_, tree) = self.subscribed(tenant)?;
        let Some(mut inode) = tree.lookup(name)? else {
            debug!(name, "file hash for an unknown inode, ignoring");
            return Ok(());
        };
        inode.hash.inode = hash;
        tree.insert(inode)?;
        Ok(())
    }

    fn remote_file_data(&mut self, tenant: &str, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let (tenant, _) = self.subscribed(tenant)?;
        fsops::write_block(&tenant.local_path(name), offset, data)
    }
}

/// Remove whatever sits at `location`. Absence is fine.
fn remove_location(location: &std::path::Path) {
    let result = if location.is_dir() {
        std::fs::remove_dir_all(location)
    } else {
        std::fs::remove_file(location)
    };
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(location = %location.display(), "move-out cleanup failed: {err}"),
    }
}
