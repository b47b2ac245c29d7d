use std::time::Duration;

/// Mirrors `CSP_RDP_MAX_WINDOW` from the reference stack, which bounds a
/// fixed-size pool of retransmit slots there. This crate's retransmit and
/// reorder queues are plain growable collections rather than a pool, so the
/// constant is kept for API parity but isn't enforced as a hard cap anywhere.
pub const CSP_RDP_MAX_WINDOW: usize = 5;

/// Per-connection tuning parameters, negotiated during the handshake via the
/// SYN payload. The values here are the ones an active opener proposes; a
/// passive opener adopts whatever the SYN carries instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdpConfig {
    pub window_size: u16,
    pub conn_timeout_ms: u64,
    pub packet_timeout_ms: u64,
    pub delayed_acks: bool,
    pub ack_timeout_ms: u64,
    pub ack_delay_count: u16,
}

impl RdpConfig {
    pub fn conn_timeout(&self) -> Duration {
        Duration::from_millis(self.conn_timeout_ms)
    }

    pub fn packet_timeout(&self) -> Duration {
        Duration::from_millis(self.packet_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for RdpConfig {
    fn default() -> Self {
        RdpConfig {
            window_size: 10,
            conn_timeout_ms: 10_000,
            packet_timeout_ms: 1_000,
            delayed_acks: true,
            ack_timeout_ms: 500,
            ack_delay_count: 5,
        }
    }
}
