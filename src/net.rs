//! Peer networking: connections, the connection registry, and dialing.

pub mod conn;
pub mod handlers;
pub mod queue;

pub use conn::{Connection, Reconnect};
pub use queue::{PacketBuilder, SendQueue};

use std::sync::{Arc, Weak};
use std::time::Duration;

use iroh_metrics::inc;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::actor::ActorHandle;
use crate::config::PeerConfig;
use crate::metrics::Metrics;
use crate::proto::OutPacket;

/// Everything a connection needs from the daemon it belongs to.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub actor: ActorHandle,
    pub registry: Registry,
    /// Our server identity, sent in version packets and stamped into ticks.
    pub server: u32,
    pub heartbeat: Duration,
    /// Capacity of each connection's outbound ring.
    pub send_queue: usize,
    /// Parent token; closing it tears down every connection.
    pub cancel: CancellationToken,
}

/// The daemon-wide table of live connections.
///
/// Holds weak references so the table never keeps a connection alive;
/// slots vacated by dropped connections are reused before the table grows.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Vec<Weak<Connection>>>>,
}

impl Registry {
    /// Add a connection, reusing a dead slot when one exists.
    pub fn register(&self, conn: &Arc<Connection>) {
        let mut table = self.inner.lock();
        let slot = Arc::downgrade(conn);
        if let Some(vacant) = table.iter_mut().find(|weak| weak.strong_count() == 0) {
            *vacant = slot;
        } else {
            table.push(slot);
        }
    }

    /// Snapshot of the currently live connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Queue one builder per live connection; returns how many accepted.
    ///
    /// A connection closing mid-walk is tolerated: queueing on it is a
    /// no-op that simply does not count.
    pub fn broadcast(&self, builder: impl Fn() -> OutPacket + Send + Sync + 'static) -> usize {
        let builder = Arc::new(builder);
        let mut queued = 0;
        for conn in self.connections() {
            let builder = builder.clone();
            if conn.queue(Box::new(move || builder())) {
                queued += 1;
            }
        }
        inc!(Metrics, broadcasts);
        queued
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Dial a configured peer, arming the reconnect watchdog when configured.
pub async fn dial(peer: PeerConfig, ctx: ConnContext) {
    let reconnect = peer
        .reconnect()
        .map(|interval| Arc::new(Reconnect::new(peer.clone(), interval)));
    if let Some(reconnect) = &reconnect {
        tokio::spawn(watchdog(reconnect.clone(), ctx.clone()));
    }
    connect_once(&peer, &ctx, reconnect).await;
}

async fn connect_once(peer: &PeerConfig, ctx: &ConnContext, reconnect: Option<Arc<Reconnect>>) {
    match TcpStream::connect(peer.addr).await {
        Ok(stream) => {
            inc!(Metrics, connections_dialed);
            debug!(peer = %peer.addr, "connected");
            Connection::spawn(stream, ctx, reconnect);
        }
        Err(err) => {
            // with a reconnect record armed, the watchdog keeps trying
            warn!(peer = %peer.addr, "dial failed: {err}");
        }
    }
}

/// Re-dial a peer whose connection has seen no activity for one interval.
async fn watchdog(reconnect: Arc<Reconnect>, ctx: ConnContext) {
    let mut deadline_rx = reconnect.subscribe();
    loop {
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                inc!(Metrics, reconnects);
                if let Some(stale) = reconnect.socket.lock().upgrade() {
                    debug!(conn = stale.num(), "watchdog closing a quiet connection");
                    stale.close();
                }
                reconnect.rearm();
                let peer = reconnect.peer.clone();
                connect_once(&peer, &ctx, Some(reconnect.clone())).await;
            }
        }
    }
}
