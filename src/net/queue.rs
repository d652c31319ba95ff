//! The per-connection outbound packet queue.

use std::collections::VecDeque;

use iroh_metrics::inc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::metrics::Metrics;
use crate::proto::OutPacket;

/// A deferred packet. Evaluated exactly once, on the owning connection's
/// sending task, to produce the bytes that go on the wire.
pub type PacketBuilder = Box<dyn FnOnce() -> OutPacket + Send + 'static>;

/// Bounded FIFO of packet builders with a wakeup signal for the sender.
///
/// When the ring is full the builder is dropped (a spill) and the caller is
/// told so. Spills are harmless: reconciliation is idempotent and retries on
/// the next hash mismatch.
pub struct SendQueue {
    ring: Mutex<VecDeque<PacketBuilder>>,
    capacity: usize,
    notify: Notify,
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("len", &self.ring.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append a builder, or spill it if the ring is at capacity.
    ///
    /// The wakeup is raised only after the builder is committed; raising it
    /// earlier would let the sender observe an empty ring.
    pub fn push(&self, builder: PacketBuilder) -> bool {
        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.capacity {
                inc!(Metrics, send_queue_spills);
                return false;
            }
            ring.push_back(builder);
        }
        self.notify.notify_one();
        true
    }

    /// Take the oldest builder, if any.
    pub fn pop(&self) -> Option<PacketBuilder> {
        self.ring.lock().pop_front()
    }

    /// Wait until at least one push has happened since the last drain.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }
}
