//! Metrics for the rask daemon.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Counters tracked by a running node.
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub connections_accepted: Counter,
    pub connections_dialed: Counter,
    pub connections_closed: Counter,
    pub reconnects: Counter,
    pub packets_sent: Counter,
    pub packets_recv: Counter,
    pub heartbeats_sent: Counter,
    pub send_queue_spills: Counter,
    pub unknown_opcodes: Counter,
    pub broadcasts: Counter,
    pub inodes_applied_directory: Counter,
    pub inodes_applied_file: Counter,
    pub inodes_applied_move_out: Counter,
    pub inodes_ignored_stale: Counter,
    pub sweep_folders: Counter,
    pub sweep_files: Counter,
    pub sweep_ignored: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            connections_accepted: Counter::new("Inbound connections accepted"),
            connections_dialed: Counter::new("Outbound connections dialed"),
            connections_closed: Counter::new("Connections closed for any reason"),
            reconnects: Counter::new("Watchdog-triggered reconnect attempts"),
            packets_sent: Counter::new("Packets written to a peer"),
            packets_recv: Counter::new("Packets read from a peer"),
            heartbeats_sent: Counter::new("Version packets sent by the heartbeat"),
            send_queue_spills: Counter::new("Packets dropped because the send queue was full"),
            unknown_opcodes: Counter::new("Packets skipped due to an unknown opcode"),
            broadcasts: Counter::new("Broadcast packets fanned out"),
            inodes_applied_directory: Counter::new("Remote directory inodes applied"),
            inodes_applied_file: Counter::new("Remote file inodes applied"),
            inodes_applied_move_out: Counter::new("Remote move-out markers applied"),
            inodes_ignored_stale: Counter::new("Remote inodes ignored due to an older tick"),
            sweep_folders: Counter::new("Folders visited by the startup sweep"),
            sweep_files: Counter::new("Files recorded by the startup sweep"),
            sweep_ignored: Counter::new("Directory entries the sweep ignored"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "rask"
    }
}
