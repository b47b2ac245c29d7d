//! The per-connection control block: state machine, send/receive windows,
//! retransmit queue, and reorder buffer. Explicit `State`, a queue of
//! in-flight segments, and a condvar-driven wakeup contract owned by the
//! caller — the same shape TCP implementations use, generalized here from
//! a byte stream's 32-bit offsets to RDP's 16-bit per-packet sequence
//! numbers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::addr::Quad;
use crate::config::RdpConfig;
use crate::err::RdpError;
use crate::router::RouterHandle;
use crate::wire::{self, RdpHeader, SynParams};

/// Fixed per the reference design: 1000 for active opens, 2000 for passive.
const ACTIVE_ISS: u16 = 1000;
const PASSIVE_ISS: u16 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Open,
    CloseWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Active,
    Passive,
}

#[derive(Debug, Clone)]
struct RetransmitEntry {
    seq_nr: u16,
    data: Vec<u8>,
    enqueued_at: Instant,
}

/// What happened during an `on_segment` call that the table/manager above
/// needs to act on — relocating the connection between maps, waking a
/// blocked caller, or tearing it down. A set of independent flags rather
/// than a single-variant outcome: RDP's transitions can raise more than one
/// of these in a single segment (e.g. completing the active handshake both
/// opens the connection and wakes the connector).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngressEffects {
    pub became_open: bool,
    pub wake_tx: bool,
    pub delivered: bool,
    pub closed: bool,
    /// The peer reset an accepted connection (OPEN/etc. -> CLOSE_WAIT). A
    /// sentinel has been pushed onto `rx_app`; the table above just needs to
    /// wake anyone blocked in `recv`.
    pub peer_reset: bool,
}

/// A connection's full state: the control block behind one RDP socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub quad: Quad,
    pub state: State,
    pub kind: Kind,
    pub config: RdpConfig,

    snd_iss: u16,
    snd_nxt: u16,
    snd_una: u16,

    rcv_irs: u16,
    rcv_cur: u16,
    rcv_lsa: u16,

    ack_timestamp: Instant,
    pub open_timestamp: Instant,

    tx_queue: VecDeque<RetransmitEntry>,
    rx_queue: Vec<(u16, Vec<u8>)>,
    pub rx_app: VecDeque<Vec<u8>>,

    /// `Some(port)` until the first payload after a passive handshake posts
    /// this connection to that listener's accept backlog; `None` afterward
    /// (the sentinel meaning "already accepted", or "not applicable" for an
    /// actively-opened connection).
    pub pending_accept_port: Option<u8>,
}

impl Connection {
    pub fn closed(quad: Quad, config: RdpConfig, now: Instant) -> Connection {
        Connection {
            quad,
            state: State::Closed,
            kind: Kind::Active,
            config,
            snd_iss: 0,
            snd_nxt: 0,
            snd_una: 0,
            rcv_irs: 0,
            rcv_cur: 0,
            rcv_lsa: 0,
            ack_timestamp: now,
            open_timestamp: now,
            tx_queue: VecDeque::new(),
            rx_queue: Vec::new(),
            rx_app: VecDeque::new(),
            pending_accept_port: None,
        }
    }

    /// A freshly bound passive socket, lazily created on the first inbound
    /// segment for a listening port.
    pub fn listen(quad: Quad, config: RdpConfig, listener_port: u8, now: Instant) -> Connection {
        Connection {
            kind: Kind::Passive,
            state: State::Listen,
            pending_accept_port: Some(listener_port),
            ..Connection::closed(quad, config, now)
        }
    }

    /// Build (but do not yet transmit) the SYN that opens an active connect.
    pub fn connect_active(quad: Quad, config: RdpConfig, now: Instant) -> Connection {
        let mut c = Connection::closed(quad, config, now);
        c.kind = Kind::Active;
        c.state = State::SynSent;
        c.snd_iss = ACTIVE_ISS;
        c.snd_una = ACTIVE_ISS;
        c.snd_nxt = ACTIVE_ISS.wrapping_add(1);
        c.open_timestamp = now;
        c
    }

    pub fn is_accepted(&self) -> bool {
        self.pending_accept_port.is_none()
    }

    fn window(&self) -> u16 {
        self.config.window_size
    }

    /// `snd_nxt - snd_una + 1 >= window_size` means the sender has exhausted
    /// its credit and must block.
    pub fn has_send_credit(&self) -> bool {
        let outstanding = self.snd_nxt.wrapping_sub(self.snd_una).wrapping_add(1);
        outstanding < self.window()
    }

    /// §4.8 producer wakeup condition.
    pub fn should_wake_producer(&self) -> bool {
        self.state == State::Open
            && (self.tx_queue.len() as u16) < self.window().saturating_sub(1)
            && wire::wrapping_lt(self.snd_nxt, self.snd_una.wrapping_add(2 * self.window()))
    }

    fn park_and_send(&mut self, header: RdpHeader, payload: Vec<u8>, now: Instant, router: &mut dyn RouterHandle) {
        let mut bytes = payload;
        header.append_to(&mut bytes);
        self.tx_queue.push_back(RetransmitEntry { seq_nr: header.seq_nr, data: bytes.clone(), enqueued_at: now });
        let _ = router.send_direct(self.quad, bytes);
    }

    fn send_control(&self, header: RdpHeader, payload: Vec<u8>, router: &mut dyn RouterHandle) {
        let mut bytes = payload;
        header.append_to(&mut bytes);
        let _ = router.send_direct(self.quad, bytes);
    }

    pub fn emit_syn(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let params = SynParams {
            window_size: self.config.window_size as u32,
            conn_timeout_ms: self.config.conn_timeout_ms as u32,
            packet_timeout_ms: self.config.packet_timeout_ms as u32,
            delayed_acks: self.config.delayed_acks as u32,
            ack_timeout_ms: self.config.ack_timeout_ms as u32,
            ack_delay_count: self.config.ack_delay_count as u32,
        };
        let header = RdpHeader { rst: false, eak: false, ack: false, syn: true, seq_nr: self.snd_iss, ack_nr: 0 };
        self.park_and_send(header, params.encode().to_vec(), now, router);
    }

    fn emit_syn_ack(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let params = SynParams {
            window_size: self.config.window_size as u32,
            conn_timeout_ms: self.config.conn_timeout_ms as u32,
            packet_timeout_ms: self.config.packet_timeout_ms as u32,
            delayed_acks: self.config.delayed_acks as u32,
            ack_timeout_ms: self.config.ack_timeout_ms as u32,
            ack_delay_count: self.config.ack_delay_count as u32,
        };
        let header = RdpHeader { rst: false, eak: false, ack: true, syn: true, seq_nr: self.snd_iss, ack_nr: self.rcv_cur };
        self.park_and_send(header, params.encode().to_vec(), now, router);
    }

    fn send_ack(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let header = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: self.snd_nxt, ack_nr: self.rcv_cur };
        self.send_control(header, Vec::new(), router);
        self.rcv_lsa = self.rcv_cur;
        self.ack_timestamp = now;
    }

    fn maybe_ack(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let pending = self.rcv_cur.wrapping_sub(self.rcv_lsa);
        if !self.config.delayed_acks || pending > self.config.ack_delay_count {
            self.send_ack(now, router);
        }
    }

    fn emit_eack(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let mut seqs: Vec<u16> = self.rx_queue.iter().map(|(seq, _)| *seq).collect();
        seqs.sort_unstable();
        let header = RdpHeader { rst: false, eak: true, ack: true, syn: false, seq_nr: self.snd_nxt, ack_nr: self.rcv_cur };
        self.send_control(header, wire::encode_eack_list(&seqs), router);
        self.rcv_lsa = self.rcv_cur;
        self.ack_timestamp = now;
    }

    pub fn send_rst(&self, router: &mut dyn RouterHandle) {
        let header = RdpHeader { rst: true, eak: false, ack: false, syn: false, seq_nr: self.snd_nxt, ack_nr: 0 };
        self.send_control(header, Vec::new(), router);
    }

    pub fn send_rst_ack(&self, router: &mut dyn RouterHandle) {
        let header = RdpHeader { rst: true, eak: false, ack: true, syn: false, seq_nr: self.snd_nxt, ack_nr: self.rcv_cur };
        self.send_control(header, Vec::new(), router);
    }

    /// §4.4 — hand a user payload to the send window.
    pub fn send(&mut self, payload: Vec<u8>, now: Instant, router: &mut dyn RouterHandle) -> Result<(), RdpError> {
        if self.state != State::Open {
            return Err(RdpError::NoSuchConnection);
        }
        let header = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: self.snd_nxt, ack_nr: self.rcv_cur };
        self.park_and_send(header, payload, now, router);
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.rcv_lsa = self.rcv_cur;
        self.ack_timestamp = now;
        Ok(())
    }

    fn adopt_peer_params(&mut self, params: SynParams) {
        self.config.window_size = params.window_size.min(u16::MAX as u32) as u16;
        self.config.conn_timeout_ms = params.conn_timeout_ms as u64;
        self.config.packet_timeout_ms = params.packet_timeout_ms as u64;
        self.config.delayed_acks = params.delayed_acks != 0;
        self.config.ack_timeout_ms = params.ack_timeout_ms as u64;
        self.config.ack_delay_count = params.ack_delay_count.min(u16::MAX as u32) as u16;
    }

    fn rx_queue_insert(&mut self, seq: u16, payload: Vec<u8>) {
        if !self.rx_queue.iter().any(|(s, _)| *s == seq) {
            self.rx_queue.push((seq, payload));
        }
    }

    /// §4.6 — repeatedly pull the next in-order segment out of the reorder
    /// buffer. Deliberately the simple O(n^2)-worst-case rescan: window
    /// sizes here are small enough that this never matters in practice.
    fn drain_rx_queue(&mut self, fx: &mut IngressEffects, now: Instant, router: &mut dyn RouterHandle) {
        loop {
            let want = self.rcv_cur.wrapping_add(1);
            let pos = self.rx_queue.iter().position(|(seq, _)| *seq == want);
            let Some(pos) = pos else { break };
            let (seq, data) = self.rx_queue.remove(pos);
            self.rcv_cur = seq;
            self.rx_app.push_back(data);
            fx.delivered = true;
            self.maybe_ack(now, router);
        }
    }

    fn eack_flush(&mut self, listed: &[u16], now: Instant) {
        let expired_at = now
            .checked_sub(self.config.packet_timeout())
            .unwrap_or(now);
        for entry in self.tx_queue.iter_mut() {
            if !listed.contains(&entry.seq_nr) && listed.iter().any(|&s| wire::wrapping_lt(entry.seq_nr, s)) {
                entry.enqueued_at = expired_at;
            }
        }
        self.tx_queue.retain(|entry| !listed.contains(&entry.seq_nr));
    }

    /// §4.5 — the full ingress dispatch, one state at a time.
    pub fn on_segment(
        &mut self,
        header: RdpHeader,
        payload: &[u8],
        now: Instant,
        router: &mut dyn RouterHandle,
    ) -> IngressEffects {
        let mut fx = IngressEffects::default();
        log::trace!("{}: {:?} <- rst={} eak={} ack={} syn={} seq={} ack_nr={}", self.quad, self.state, header.rst, header.eak, header.ack, header.syn, header.seq_nr, header.ack_nr);

        if self.state == State::Closed {
            self.state = State::Listen;
            self.open_timestamp = now;
            log::debug!("{}: CLOSED -> LISTEN (lazily bound)", self.quad);
        }

        if header.rst {
            if header.ack {
                self.snd_una = header.ack_nr.wrapping_add(1);
            }
            match self.state {
                State::CloseWait => {
                    self.state = State::Closed;
                    fx.closed = true;
                    log::debug!("{}: CLOSE_WAIT -> CLOSED (peer RST)", self.quad);
                }
                _ => {
                    if header.seq_nr == self.rcv_cur.wrapping_add(1) {
                        let prev = self.state;
                        self.send_rst_ack(router);
                        self.state = State::CloseWait;
                        self.open_timestamp = now;
                        log::debug!("{}: peer reset, {:?} -> CLOSE_WAIT", self.quad, prev);
                        if self.is_accepted() {
                            self.rx_app.push_back(Vec::new());
                            fx.peer_reset = true;
                        }
                    }
                }
            }
            return fx;
        }

        match self.state {
            State::Closed => unreachable!("lazily promoted to Listen above"),

            State::Listen => {
                if header.syn {
                    match SynParams::decode(payload) {
                        Ok(params) => self.adopt_peer_params(params),
                        Err(_) => {
                            log::warn!("{}: malformed SYN payload, dropping", self.quad);
                            return fx;
                        }
                    }
                    self.snd_iss = PASSIVE_ISS;
                    self.snd_una = PASSIVE_ISS;
                    self.snd_nxt = PASSIVE_ISS.wrapping_add(1);
                    self.rcv_irs = header.seq_nr;
                    self.rcv_cur = header.seq_nr;
                    self.rcv_lsa = header.seq_nr;
                    self.state = State::SynRcvd;
                    self.open_timestamp = now;
                    log::debug!("{}: LISTEN -> SYN_RCVD", self.quad);
                    self.emit_syn_ack(now, router);
                } else if header.ack {
                    self.send_rst(router);
                    self.state = State::Closed;
                    fx.closed = true;
                    log::debug!("{}: LISTEN -> CLOSED (bare ACK, no SYN)", self.quad);
                }
            }

            State::SynSent => {
                if header.syn && header.ack {
                    self.rcv_irs = header.seq_nr;
                    self.rcv_cur = header.seq_nr;
                    self.rcv_lsa = header.seq_nr;
                    self.snd_una = header.ack_nr.wrapping_add(1);
                    self.state = State::Open;
                    self.open_timestamp = now;
                    if !self.config.delayed_acks {
                        self.send_ack(now, router);
                    }
                    fx.became_open = true;
                    fx.wake_tx = true;
                    log::debug!("{}: SYN_SENT -> OPEN", self.quad);
                } else if header.ack {
                    self.send_rst(router);
                    fx.wake_tx = true;
                    log::debug!("{}: SYN_SENT half-open reply, resetting for a retry", self.quad);
                } else {
                    self.state = State::Closed;
                    fx.closed = true;
                    log::debug!("{}: SYN_SENT -> CLOSED (unexpected reply)", self.quad);
                }
            }

            State::SynRcvd | State::Open => {
                let prev = self.state;
                if header.syn || !header.ack {
                    self.state = State::Closed;
                    fx.closed = true;
                    log::debug!("{}: {:?} -> CLOSED (unexpected syn/missing ack)", self.quad, prev);
                    return fx;
                }

                let seq = header.seq_nr;
                let window_hi = self.rcv_cur.wrapping_add(2 * self.window());
                let out_of_window = wire::wrapping_le(seq, self.rcv_cur) || wire::wrapping_lt(window_hi, seq);
                if out_of_window {
                    log::trace!("{}: seq {} out of window, replying with {}", self.quad, seq, if header.syn { "SYN+ACK" } else { "EACK" });
                    if header.syn {
                        self.emit_syn_ack(now, router);
                    } else {
                        self.emit_eack(now, router);
                    }
                    return fx;
                }

                let ack = header.ack_nr;
                let ack_lo = self
                    .snd_una
                    .wrapping_sub(1)
                    .wrapping_sub(2 * self.window());
                let ack_ok = wire::wrapping_le(ack_lo, ack) && wire::wrapping_lt(ack, self.snd_nxt);
                if !ack_ok {
                    self.state = State::Closed;
                    fx.closed = true;
                    log::debug!("{}: {:?} -> CLOSED (ack {} outside send window)", self.quad, prev, ack);
                    return fx;
                }

                if self.state == State::SynRcvd {
                    if ack != self.snd_iss {
                        self.state = State::Closed;
                        fx.closed = true;
                        log::debug!("{}: SYN_RCVD -> CLOSED (ack did not confirm our SYN)", self.quad);
                        return fx;
                    }
                    self.state = State::Open;
                    self.open_timestamp = now;
                    fx.became_open = true;
                    log::debug!("{}: SYN_RCVD -> OPEN", self.quad);
                }

                self.snd_una = ack.wrapping_add(1);
                self.tx_queue.retain(|e| !wire::wrapping_lt(e.seq_nr, self.snd_una));

                if header.eak && !payload.is_empty() {
                    match wire::decode_eack_list(payload) {
                        Ok(listed) => {
                            log::trace!("{}: EACK lists {:?}", self.quad, listed);
                            self.eack_flush(&listed, now);
                        }
                        Err(_) => log::warn!("{}: malformed EACK payload, ignoring", self.quad),
                    }
                    return fx;
                }

                if payload.is_empty() {
                    return fx;
                }

                if seq != self.rcv_cur.wrapping_add(1) {
                    log::trace!("{}: seq {} out of order, buffering (want {})", self.quad, seq, self.rcv_cur.wrapping_add(1));
                    self.rx_queue_insert(seq, payload.to_vec());
                    self.emit_eack(now, router);
                    return fx;
                }

                self.rcv_cur = seq;
                self.rx_app.push_back(payload.to_vec());
                fx.delivered = true;
                log::trace!("{}: delivered seq {}", self.quad, seq);
                self.maybe_ack(now, router);
                self.drain_rx_queue(&mut fx, now, router);
            }

            State::CloseWait => {
                let ack = header.ack_nr;
                let ack_lo = self.snd_una.wrapping_sub(1).wrapping_sub(2 * self.window());
                if header.ack && wire::wrapping_le(ack_lo, ack) && wire::wrapping_lt(ack, self.snd_nxt) {
                    self.snd_una = ack.wrapping_add(1);
                }
                log::trace!("{}: CLOSE_WAIT re-sending RST+ACK", self.quad);
                self.send_rst_ack(router);
            }
        }

        fx
    }

    /// §4.8 — retransmit pass: drop acknowledged entries, resend anything
    /// that has sat unacknowledged past the packet timeout.
    pub fn retransmit_pass(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        let snd_una = self.snd_una;
        self.tx_queue.retain(|e| !wire::wrapping_lt(e.seq_nr, snd_una));
        let rcv_cur = self.rcv_cur;
        let packet_timeout = self.config.packet_timeout();
        for entry in self.tx_queue.iter_mut() {
            if now.duration_since(entry.enqueued_at) >= packet_timeout {
                log::debug!("{}: retransmitting seq {}", self.quad, entry.seq_nr);
                wire::patch_ack_nr(&mut entry.data, rcv_cur);
                entry.enqueued_at = now;
                let _ = router.send_direct(self.quad, entry.data.clone());
            }
        }
    }

    /// §4.8 — flush a pending delayed ACK once it has waited long enough.
    pub fn delayed_ack_pass(&mut self, now: Instant, router: &mut dyn RouterHandle) {
        if self.rcv_lsa != self.rcv_cur && now.duration_since(self.ack_timestamp) > self.config.ack_timeout() {
            log::trace!("{}: flushing delayed ack up to {}", self.quad, self.rcv_cur);
            self.send_ack(now, router);
        }
    }

    pub fn discard_tx_queue(&mut self) {
        self.tx_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::CspId;

    fn quad() -> Quad {
        Quad { src: CspId { addr: 1, port: 10 }, dst: CspId { addr: 2, port: 10 } }
    }

    struct Sink(Vec<(Quad, Vec<u8>)>);
    impl RouterHandle for Sink {
        fn send_direct(&mut self, quad: Quad, data: Vec<u8>) -> Result<(), RdpError> {
            self.0.push((quad, data));
            Ok(())
        }
    }

    #[test]
    fn active_connect_builds_syn_sent_with_fixed_iss() {
        let conn = Connection::connect_active(quad(), RdpConfig::default(), Instant::now());
        assert_eq!(conn.state, State::SynSent);
        assert_eq!(conn.snd_una, ACTIVE_ISS);
        assert_eq!(conn.snd_nxt, ACTIVE_ISS.wrapping_add(1));
    }

    #[test]
    fn passive_handshake_reaches_open_and_adopts_peer_window() {
        let now = Instant::now();
        let mut responder = Connection::listen(quad(), RdpConfig::default(), 10, now);
        let mut sink = Sink(Vec::new());

        let params = SynParams { window_size: 5, conn_timeout_ms: 10_000, packet_timeout_ms: 1_000, delayed_acks: 0, ack_timeout_ms: 500, ack_delay_count: 5 };
        let syn = RdpHeader { rst: false, eak: false, ack: false, syn: true, seq_nr: ACTIVE_ISS, ack_nr: 0 };
        let fx = responder.on_segment(syn, &params.encode(), now, &mut sink);
        assert_eq!(responder.state, State::SynRcvd);
        assert!(!fx.became_open);
        assert_eq!(responder.config.window_size, 5);

        let ack = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: ACTIVE_ISS.wrapping_add(1), ack_nr: PASSIVE_ISS };
        let fx = responder.on_segment(ack, &[], now, &mut sink);
        assert!(fx.became_open);
        assert_eq!(responder.state, State::Open);
    }

    #[test]
    fn rst_in_close_wait_finishes_teardown() {
        let now = Instant::now();
        let mut conn = Connection::connect_active(quad(), RdpConfig::default(), now);
        conn.state = State::CloseWait;
        let mut sink = Sink(Vec::new());
        let rst = RdpHeader { rst: true, eak: false, ack: false, syn: false, seq_nr: 0, ack_nr: 0 };
        let fx = conn.on_segment(rst, &[], now, &mut sink);
        assert!(fx.closed);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn out_of_order_segment_is_buffered_then_drained_in_order() {
        let now = Instant::now();
        let mut conn = Connection::connect_active(quad(), RdpConfig::default(), now);
        conn.state = State::Open;
        conn.rcv_cur = 4999;
        conn.rcv_lsa = 4999;
        conn.snd_una = ACTIVE_ISS;
        conn.snd_nxt = ACTIVE_ISS.wrapping_add(1);
        let mut sink = Sink(Vec::new());

        let out_of_order = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: 5001, ack_nr: ACTIVE_ISS };
        let fx = conn.on_segment(out_of_order, b"second", now, &mut sink);
        assert!(!fx.delivered);
        assert_eq!(conn.rcv_cur, 4999);

        let in_order = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: 5000, ack_nr: ACTIVE_ISS };
        let fx = conn.on_segment(in_order, b"first", now, &mut sink);
        assert!(fx.delivered);
        assert_eq!(conn.rcv_cur, 5001);
        assert_eq!(conn.rx_app.len(), 2);
        assert_eq!(conn.rx_app[0], b"first");
        assert_eq!(conn.rx_app[1], b"second");
    }
}
