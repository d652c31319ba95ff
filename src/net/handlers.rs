//! Opcode handlers and outbound packet builders.
//!
//! Handlers run on the connection's reader task. They parse the packet body
//! and post the heavy lifting to the worker actor; nothing here touches the
//! filesystem or the document store.

use std::sync::Arc;

use anyhow::Result;
use iroh_metrics::inc;
use tracing::{debug, trace, warn};

use super::Connection;
use crate::actor::Action;
use crate::metrics::Metrics;
use crate::proto::{InPacket, Opcode, OutPacket, PROTOCOL_VERSION};
use crate::tree::{FileStat, Inode, TreeHash, FANOUT};

/// Dispatch one received packet by opcode.
///
/// Any error closes the connection; unknown opcodes are skipped. Unread
/// trailing bytes are discarded when the packet is dropped.
pub async fn dispatch(
    conn: &Arc<Connection>,
    opcode: Opcode,
    raw: u8,
    mut packet: InPacket,
) -> Result<()> {
    match opcode {
        Opcode::Version => receive_version(conn, &mut packet).await?,
        Opcode::Tenant => receive_tenant(conn, &mut packet).await?,
        Opcode::TenantHash => receive_tenant_hash(conn, &mut packet).await?,
        Opcode::FileHash => receive_file_hash(conn, &mut packet).await?,
        Opcode::FileExists => receive_file_exists(conn, &mut packet).await?,
        Opcode::CreateDirectory => receive_create_directory(conn, &mut packet).await?,
        Opcode::MoveOut => receive_move_out(conn, &mut packet).await?,
        Opcode::FileDataBlock => receive_file_data_block(conn, &mut packet).await?,
        Opcode::Unknown => {
            inc!(Metrics, unknown_opcodes);
            warn!(opcode = raw, bytes = packet.remaining(), "skipping unknown opcode");
        }
    }
    if !packet.is_empty() {
        trace!(remaining = packet.remaining(), "discarding trailing packet bytes");
    }
    Ok(())
}

/// Our version packet: protocol version plus our server identity.
pub fn version_packet(server: u32) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::Version);
    packet.write_u8(PROTOCOL_VERSION).write_u32(server);
    packet
}

async fn receive_version(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let version = packet.read_u8()?;
    conn.set_peer_version(version);
    let identity = if packet.remaining() >= 4 {
        packet.read_u32()?
    } else {
        // a bare heartbeat from before identities rode along
        0
    };
    debug!(version, identity, "version packet");
    if identity != 0 && conn.set_identity(identity) {
        conn.actor()
            .send(Action::Advertise { conn: conn.clone() })
            .await?;
    }
    Ok(())
}

/// Advertise a tenant's top-level hash.
pub fn tenant_packet(name: &str, hash: &TreeHash) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::Tenant);
    packet.write_str(name).write_bytes(&hash.0);
    packet
}

async fn receive_tenant(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let name = packet.read_string()?;
    let hash = TreeHash(packet.read_digest()?);
    debug!(tenant = %name, %hash, "tenant packet");
    if conn.identity() == 0 {
        debug!("tenant packet before the peer identified itself, ignoring");
        return Ok(());
    }
    conn.actor()
        .send(Action::TenantAdvertised {
            conn: conn.clone(),
            name,
            hash,
        })
        .await
}

/// One layer of child rollup hashes: `(suffix, hash)` entries until the
/// packet runs out.
pub fn tenant_hash_packet(
    name: &str,
    prefix: &str,
    children: &[Option<TreeHash>; FANOUT],
) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::TenantHash);
    packet.write_str(name).write_str(prefix);
    for (index, child) in children.iter().enumerate() {
        if let Some(hash) = child {
            packet.write_u8(index as u8).write_bytes(&hash.0);
        }
    }
    packet
}

async fn receive_tenant_hash(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let name = packet.read_string()?;
    let prefix = packet.read_string()?;
    let mut hashes = Box::new([None; FANOUT]);
    while !packet.is_empty() {
        let suffix = (packet.read_u8()? & 31) as usize;
        hashes[suffix] = Some(TreeHash(packet.read_digest()?));
    }
    debug!(tenant = %name, prefix = %prefix, "tenant hash packet");
    conn.actor()
        .send(Action::TenantHashes {
            conn: conn.clone(),
            name,
            prefix,
            hashes,
        })
        .await
}

/// A directory inode.
pub fn create_directory_out(tenant: &str, inode: &Inode) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::CreateDirectory);
    packet
        .write_tick(inode.priority)
        .write_str(tenant)
        .write_str(&inode.name);
    packet
}

async fn receive_create_directory(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let priority = packet.read_tick()?;
    let tenant = packet.read_string()?;
    let name = packet.read_string()?;
    debug!(%priority, tenant = %tenant, name = %name, "create directory");
    conn.actor()
        .send(Action::RemoteDirectory {
            tenant,
            name,
            priority,
        })
        .await
}

/// A file inode with its stat.
pub fn file_exists_out(tenant: &str, inode: &Inode) -> OutPacket {
    let stat = inode.stat.unwrap_or(FileStat::new(0, 0));
    let mut packet = OutPacket::new(Opcode::FileExists);
    packet
        .write_tick(inode.priority)
        .write_str(tenant)
        .write_str(&inode.name)
        .write_u64(stat.size.bytes)
        .write_i64(stat.modified);
    packet
}

async fn receive_file_exists(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let priority = packet.read_tick()?;
    let tenant = packet.read_string()?;
    let name = packet.read_string()?;
    let size = packet.read_u64()?;
    let modified = packet.read_i64()?;
    debug!(%priority, tenant = %tenant, name = %name, size, "file exists");
    conn.actor()
        .send(Action::RemoteFile {
            tenant,
            name,
            priority,
            stat: FileStat::new(size, modified),
        })
        .await
}

/// A move-out marker.
pub fn move_out_packet(tenant: &str, inode: &Inode) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::MoveOut);
    packet
        .write_tick(inode.priority)
        .write_str(tenant)
        .write_str(&inode.name);
    packet
}

async fn receive_move_out(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let priority = packet.read_tick()?;
    let tenant = packet.read_string()?;
    let name = packet.read_string()?;
    debug!(%priority, tenant = %tenant, name = %name, "move out");
    conn.actor()
        .send(Action::RemoteMoveOut {
            tenant,
            name,
            priority,
        })
        .await
}

/// Content hash for a file that has no priority yet.
pub fn file_hash_out(tenant: &str, name: &str, hash: &TreeHash) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::FileHash);
    packet.write_str(tenant).write_str(name).write_bytes(&hash.0);
    packet
}

async fn receive_file_hash(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let tenant = packet.read_string()?;
    let name = packet.read_string()?;
    let hash = TreeHash(packet.read_digest()?);
    debug!(tenant = %tenant, name = %name, %hash, "file hash");
    conn.actor()
        .send(Action::RemoteFileHash { tenant, name, hash })
        .await
}

/// A block of file content at an offset.
pub fn file_data_block_out(tenant: &str, name: &str, offset: u64, data: &[u8]) -> OutPacket {
    let mut packet = OutPacket::new(Opcode::FileDataBlock);
    packet
        .write_str(tenant)
        .write_str(name)
        .write_u64(offset)
        .write_bytes(data);
    packet
}

async fn receive_file_data_block(conn: &Arc<Connection>, packet: &mut InPacket) -> Result<()> {
    let tenant = packet.read_string()?;
    let name = packet.read_string()?;
    let offset = packet.read_u64()?;
    let data = packet.read_remaining();
    trace!(tenant = %tenant, name = %name, offset, bytes = data.len(), "file data block");
    conn.actor()
        .send(Action::RemoteFileData {
            tenant,
            name,
            offset,
            data,
        })
        .await
}
