//! One TCP peer connection.
//!
//! A connection owns two cooperative tasks on the shared runtime: the
//! sending task drains the outbound queue and owns the heartbeat, the
//! receiving task runs the framing loop and dispatches packets. Both hold a
//! strong reference to the connection; the registry and the reconnect
//! record hold weak ones, so dropping the tasks reaps the connection.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use iroh_metrics::inc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error_span, trace, warn, Instrument};

use super::handlers;
use super::queue::{PacketBuilder, SendQueue};
use super::ConnContext;
use crate::actor::ActorHandle;
use crate::config::PeerConfig;
use crate::metrics::Metrics;
use crate::proto::{wire, DecodeError, InPacket, Opcode};

static CONN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A live connection to one peer.
pub struct Connection {
    num: usize,
    /// Identity of the peer server, 0 until a version packet arrives.
    identity: AtomicU32,
    /// Peer protocol version, 0 until a version packet arrives.
    peer_version: AtomicU8,
    queue: SendQueue,
    cancel: CancellationToken,
    /// Deadline for the next heartbeat version packet.
    heartbeat: watch::Sender<Instant>,
    heartbeat_interval: Duration,
    server: u32,
    actor: ActorHandle,
    reconnect: Option<Arc<Reconnect>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("num", &self.num)
            .field("identity", &self.identity.load(Ordering::Relaxed))
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Reconnect state for an outbound connection.
///
/// Holds the peer configuration the watchdog re-dials with and a weak
/// back-reference so the watchdog can cancel a stale socket without keeping
/// the connection alive.
#[derive(Debug)]
pub struct Reconnect {
    pub(crate) peer: PeerConfig,
    interval: Duration,
    deadline: watch::Sender<Instant>,
    pub(crate) socket: Mutex<Weak<Connection>>,
}

impl Reconnect {
    pub fn new(peer: PeerConfig, interval: Duration) -> Self {
        let (deadline, _) = watch::channel(Instant::now() + interval);
        Self {
            peer,
            interval,
            deadline,
            socket: Mutex::new(Weak::new()),
        }
    }

    /// Push the watchdog deadline out by one interval.
    pub(crate) fn rearm(&self) {
        self.deadline.send_replace(Instant::now() + self.interval);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Instant> {
        self.deadline.subscribe()
    }
}

impl Connection {
    /// Bind a socket to a new connection and start its two tasks.
    pub fn spawn<S>(
        stream: S,
        ctx: &ConnContext,
        reconnect: Option<Arc<Reconnect>>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let num = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (heartbeat, _) = watch::channel(Instant::now() + ctx.heartbeat);
        let conn = Arc::new(Connection {
            num,
            identity: AtomicU32::new(0),
            peer_version: AtomicU8::new(0),
            queue: SendQueue::new(ctx.send_queue),
            cancel: ctx.cancel.child_token(),
            heartbeat,
            heartbeat_interval: ctx.heartbeat,
            server: ctx.server,
            actor: ctx.actor.clone(),
            reconnect: reconnect.clone(),
        });
        ctx.registry.register(&conn);
        if let Some(reconnect) = &reconnect {
            *reconnect.socket.lock() = Arc::downgrade(&conn);
            reconnect.rearm();
        }
        let (reader, writer) = tokio::io::split(stream);
        let span = error_span!("conn", num);
        tokio::spawn(send_loop(conn.clone(), writer).instrument(span.clone()));
        tokio::spawn(recv_loop(conn.clone(), reader).instrument(span));
        conn
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub(crate) fn actor(&self) -> &ActorHandle {
        &self.actor
    }

    /// Queue a packet builder for sending. Safe from any task.
    ///
    /// Returns `false` if the packet spilled or the connection is closing.
    pub fn queue(&self, builder: PacketBuilder) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.queue.push(builder)
    }

    /// Queue our version packet.
    fn queue_version(&self) -> bool {
        let server = self.server;
        self.queue(Box::new(move || handlers::version_packet(server)))
    }

    /// Tear the connection down; both tasks exit at their next suspension.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            inc!(Metrics, connections_closed);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The peer's server identity, 0 until known.
    pub fn identity(&self) -> u32 {
        self.identity.load(Ordering::Relaxed)
    }

    /// Record the peer identity. Returns true the first time.
    pub(crate) fn set_identity(&self, identity: u32) -> bool {
        self.identity
            .compare_exchange(0, identity, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// The protocol version the peer announced.
    pub fn peer_version(&self) -> Option<u8> {
        match self.peer_version.load(Ordering::Relaxed) {
            0 => None,
            version => Some(version),
        }
    }

    pub(crate) fn set_peer_version(&self, version: u8) {
        self.peer_version.store(version, Ordering::Relaxed);
    }

    /// Re-arm the heartbeat so the next version packet goes out one full
    /// interval from now.
    pub(crate) fn reset_heartbeat(&self) {
        self.heartbeat
            .send_replace(Instant::now() + self.heartbeat_interval);
    }

    /// Tell the reconnect watchdog the connection is alive.
    pub(crate) fn bump_watchdog(&self) {
        if let Some(reconnect) = &self.reconnect {
            reconnect.rearm();
        }
    }
}

/// The sending task: drain the queue, write frames, own the heartbeat.
async fn send_loop<S>(conn: Arc<Connection>, mut writer: WriteHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    conn.queue_version();
    let mut deadline_rx = conn.heartbeat.subscribe();
    loop {
        while let Some(builder) = conn.queue.pop() {
            let frame = builder().encode();
            if let Err(err) = writer.write_all(&frame).await {
                debug!("write failed: {err}");
                conn.close();
                return;
            }
            inc!(Metrics, packets_sent);
            conn.reset_heartbeat();
            conn.bump_watchdog();
        }
        let deadline = *deadline_rx.borrow_and_update();
        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return,
            _ = conn.queue.ready() => {}
            changed = deadline_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                trace!("heartbeat");
                if conn.queue_version() {
                    inc!(Metrics, heartbeats_sent);
                }
                conn.reset_heartbeat();
            }
        }
    }
}

/// The receiving task: the framing loop of the protocol.
async fn recv_loop<S>(conn: Arc<Connection>, reader: ReadHalf<S>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    loop {
        let frame = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some((raw, packet))) => {
                inc!(Metrics, packets_recv);
                conn.bump_watchdog();
                let opcode = Opcode::from(raw);
                if let Err(err) = handlers::dispatch(&conn, opcode, raw, packet).await {
                    warn!(%opcode, "closing connection after failed packet: {err:#}");
                    conn.close();
                    return;
                }
                // A version packet from the peer must not push out our own
                // version send, or two idle peers would ping-pong forever.
                if opcode != Opcode::Version {
                    conn.reset_heartbeat();
                }
            }
            Ok(None) => {
                debug!("peer closed the connection");
                conn.close();
                return;
            }
            Err(err) => {
                warn!(peer = conn.identity(), "read failed: {err}");
                conn.close();
                return;
            }
        }
    }
}

/// Read one frame: size-control body length, opcode byte, body bytes.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(u8, InPacket)>, DecodeError> {
    let Some(body_len) = wire::read_size_control(reader).await? else {
        return Ok(None);
    };
    let raw = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(DecodeError::PrematureEof {
                missing: body_len + 1,
            })
        }
        Err(err) => return Err(err.into()),
    };
    let mut body = BytesMut::with_capacity(body_len);
    let mut limited = reader.take(body_len as u64);
    while body.len() < body_len {
        let read = limited.read_buf(&mut body).await?;
        if read == 0 {
            return Err(DecodeError::PrematureEof {
                missing: body_len - body.len(),
            });
        }
    }
    Ok(Some((raw, InPacket::new(body.freeze()))))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::super::Registry;
    use super::*;
    use crate::config::TenantConfig;
    use crate::proto::{OutPacket, PROTOCOL_VERSION};
    use crate::store::Store;
    use crate::tenant::Tenants;

    fn test_ctx(server: u32, heartbeat: Duration) -> (ConnContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut configs = BTreeMap::new();
        configs.insert(
            "t".to_owned(),
            TenantConfig {
                path: dir.path().to_owned(),
                subscribe: true,
            },
        );
        let store = Store::memory();
        let registry = Registry::default();
        let tenants = Tenants::from_config(&configs, &store);
        let actor = ActorHandle::spawn(server, tenants, store, registry.clone());
        (
            ConnContext {
                actor,
                registry,
                server,
                heartbeat,
                send_queue: 256,
                cancel: CancellationToken::new(),
            },
            dir,
        )
    }

    #[tokio::test]
    async fn version_handshake_both_ways() {
        let (ctx_a, _dir_a) = test_ctx(1, Duration::from_secs(5));
        let (ctx_b, _dir_b) = test_ctx(2, Duration::from_secs(5));
        let (a_end, b_end) = tokio::io::duplex(64 * 1024);

        let a = Connection::spawn(a_end, &ctx_a, None);
        let b = Connection::spawn(b_end, &ctx_b, None);

        for _ in 0..100 {
            if a.peer_version().is_some() && b.peer_version().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.peer_version(), Some(PROTOCOL_VERSION));
        assert_eq!(b.peer_version(), Some(PROTOCOL_VERSION));
        assert_eq!(a.identity(), 2);
        assert_eq!(b.identity(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_emits_one_version_per_interval() {
        let (ctx, _dir) = test_ctx(1, Duration::from_secs(5));
        let (conn_end, probe) = tokio::io::duplex(64 * 1024);
        let _conn = Connection::spawn(conn_end, &ctx, None);
        let mut probe = BufReader::new(probe);

        // the startup version packet comes immediately
        let (raw, _) = read_frame(&mut probe).await.unwrap().unwrap();
        assert_eq!(Opcode::from(raw), Opcode::Version);

        // with no other traffic, exactly one version per interval
        for _ in 0..3 {
            let started = tokio::time::Instant::now();
            let (raw, _) = read_frame(&mut probe).await.unwrap().unwrap();
            assert_eq!(Opcode::from(raw), Opcode::Version);
            assert!(
                started.elapsed() >= Duration::from_secs(5),
                "heartbeat fired early after {:?}",
                started.elapsed()
            );
        }
    }

    #[tokio::test]
    async fn decode_error_closes_the_connection() {
        let (ctx, _dir) = test_ctx(1, Duration::from_secs(5));
        let (conn_end, mut probe) = tokio::io::duplex(64 * 1024);
        let conn = Connection::spawn(conn_end, &ctx, None);

        // 0x80 is a reserved size-control byte
        probe.write_all(&[0x80]).await.unwrap();
        for _ in 0..100 {
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn unknown_opcodes_are_skipped() {
        let (ctx, _dir) = test_ctx(1, Duration::from_secs(5));
        let (conn_end, mut probe) = tokio::io::duplex(64 * 1024);
        let conn = Connection::spawn(conn_end, &ctx, None);

        // opcode 0x55 is unassigned; body is 7 bytes of junk
        probe
            .write_all(&[0x07, 0x55, b'm', b'y', b's', b't', b'e', b'r', b'y'])
            .await
            .unwrap();
        // a parseable version packet must still get through afterwards
        probe
            .write_all(&handlers::version_packet(9).encode())
            .await
            .unwrap();

        for _ in 0..100 {
            if conn.peer_version().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!conn.is_closed());
        assert_eq!(conn.identity(), 9);
    }

    #[tokio::test]
    async fn truncated_body_is_a_premature_eof() {
        // declares a 5-byte body but the stream ends after one byte
        let mut stream: &[u8] = &[0x05, 0x90, 0x01];
        let err = read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(err, DecodeError::PrematureEof { missing: 4 }));
    }

    #[tokio::test]
    async fn queue_is_a_no_op_on_a_closed_connection() {
        let (ctx, _dir) = test_ctx(1, Duration::from_secs(5));
        let (conn_end, _probe) = tokio::io::duplex(64);
        let conn = Connection::spawn(conn_end, &ctx, None);
        conn.close();
        assert!(!conn.queue(Box::new(|| OutPacket::new(Opcode::Version))));
    }
}
