//! Logical clock ticks.
//!
//! A [`Tick`] is a `(time, server)` pair totally ordered across the fleet:
//! microseconds since the unix epoch first, the originating server id as the
//! tie breaker. Ticks minted locally never reorder behind ticks overheard
//! from the wire, because every overheard time advances a process-wide floor
//! that [`Tick::now`] will not dip below.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

static CLOCK_FLOOR: AtomicI64 = AtomicI64::new(0);

/// A totally ordered logical timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick {
    /// Microseconds since the unix epoch.
    pub time: i64,
    /// Identity of the server that minted the tick.
    pub server: u32,
}

impl Tick {
    /// Mint a fresh local tick.
    ///
    /// The time is taken from the wall clock but clamped to be strictly
    /// greater than any tick previously minted or overheard by this process.
    pub fn now(server: u32) -> Self {
        let wall = unix_micros();
        let mut floor = CLOCK_FLOOR.load(Ordering::Relaxed);
        loop {
            let time = wall.max(floor + 1);
            match CLOCK_FLOOR.compare_exchange_weak(
                floor,
                time,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Tick { time, server },
                Err(seen) => floor = seen,
            }
        }
    }

    /// Record a tick received from a peer.
    ///
    /// Advances the monotonic floor so subsequent local ticks sort after it.
    pub fn overheard(time: i64, server: u32) -> Self {
        CLOCK_FLOOR.fetch_max(time, Ordering::Relaxed);
        Tick { time, server }
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.time, self.server)
    }
}

fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}
