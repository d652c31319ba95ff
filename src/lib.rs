//! Rask is a peer-to-peer file-synchronization daemon.
//!
//! A fleet of symmetric nodes each hold local copies of named *tenants*
//! (filesystem subtrees), connect to each other over TCP, and converge
//! toward a common content-addressed view of every tenant's inode tree.
//!
//! The crate is organized around three subsystems:
//!
//! * [`proto`] — the framed binary wire protocol between two peers,
//! * [`net`] — the per-connection send/receive engine: outbound packet
//!   queue, heartbeat, reconnect watchdog and the broadcast registry,
//! * [`tree`] — the per-tenant inode hash tree that drives the
//!   hash-comparison reconciliation walk.
//!
//! Everything that touches the filesystem or the node-document store runs
//! on the [`actor`] worker thread so connection reader tasks never block on
//! disk.

pub mod actor;
pub mod config;
pub mod fsops;
pub mod metrics;
pub mod net;
pub mod proto;
pub mod server;
pub mod store;
pub mod sweep;
pub mod tenant;
pub mod tick;
pub mod tree;

pub use config::Config;
pub use server::Server;
pub use tick::Tick;
