//! The RDP lock (§4.1) and the connection/listener tables it protects.
//!
//! One `Arc<Mutex<_>>` token guards every mutable structure, with a pair of
//! per-connection `Condvar`s (`tx_wait`/`rx_wait`) standing in for the
//! wakeups a blocked sender or receiver needs. `std::sync::Mutex` has no
//! timed-lock primitive, so acquisition is a bounded `try_lock` retry loop
//! instead of a single blocking call — the "token-free preflight" the
//! design notes describe is not attempted; see DESIGN.md for why.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::addr::{CspId, CspPort, Quad};
use crate::config::RdpConfig;
use crate::err::RdpError;
use crate::router::RouterHandle;
use crate::tcb::{Connection, State};

const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

struct Slot {
    conn: Connection,
    tx_wait: Arc<Condvar>,
    rx_wait: Arc<Condvar>,
}

struct Listener {
    cvar: Arc<Condvar>,
    backlog: VecDeque<Quad>,
}

#[derive(Default)]
struct Table {
    config: RdpConfig,
    connections: HashMap<Quad, Slot>,
    listeners: HashMap<CspPort, Listener>,
}

/// A handle to the shared RDP state. Cloning shares the same token and
/// tables; every clone sees the same connections.
#[derive(Clone)]
pub struct RdpContext {
    inner: Arc<Mutex<Table>>,
}

impl Default for RdpContext {
    fn default() -> Self {
        RdpContext::new(RdpConfig::default())
    }
}

impl RdpContext {
    pub fn new(config: RdpConfig) -> Self {
        RdpContext {
            inner: Arc::new(Mutex::new(Table { config, ..Default::default() })),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>, RdpError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    log::error!("rdp lock poisoned, treating as unrecoverable");
                    return Err(RdpError::LockTimeout);
                }
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        log::warn!("timed out acquiring the rdp lock; a caller may be stuck holding it");
                        return Err(RdpError::LockTimeout);
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            }
        }
    }

    /// §4.10 — replace the defaults that future passive/active opens adopt.
    /// Applied verbatim beyond a sanity check that nothing is zero: a zero
    /// `window_size`, for instance, would make `has_send_credit` never true
    /// and every future `send` would block forever.
    pub fn set_opt(&self, config: RdpConfig) -> Result<(), RdpError> {
        if config.window_size == 0
            || config.conn_timeout_ms == 0
            || config.packet_timeout_ms == 0
            || config.ack_timeout_ms == 0
            || config.ack_delay_count == 0
        {
            return Err(RdpError::ProtocolViolation("rdp config field is zero"));
        }
        self.lock()?.config = config;
        Ok(())
    }

    /// §6 — bind a listening port.
    pub fn bind(&self, port: CspPort) -> Result<(), RdpError> {
        let mut table = self.lock()?;
        if table.listeners.contains_key(&port) {
            return Err(RdpError::PortInUse(port));
        }
        table.listeners.insert(port, Listener { cvar: Arc::new(Condvar::new()), backlog: VecDeque::new() });
        Ok(())
    }

    pub fn unbind(&self, port: CspPort) -> Result<(), RdpError> {
        self.lock()?.listeners.remove(&port);
        Ok(())
    }

    /// §4.11 — allocate a CLOSED control block for a future active connect.
    pub fn allocate(&self, quad: Quad) -> Result<(), RdpError> {
        let mut table = self.lock()?;
        let config = table.config;
        table.connections.entry(quad).or_insert_with(|| Slot {
            conn: Connection::closed(quad, config, Instant::now()),
            tx_wait: Arc::new(Condvar::new()),
            rx_wait: Arc::new(Condvar::new()),
        });
        Ok(())
    }

    /// §4.11 — unconditional discard of queued retransmissions, distinct
    /// from the selective EACK-driven prune.
    pub fn flush_all(&self, quad: Quad) -> Result<(), RdpError> {
        if let Some(slot) = self.lock()?.connections.get_mut(&quad) {
            slot.conn.discard_tx_queue();
        }
        Ok(())
    }

    /// §4.2 — active connect, including the single half-open retry.
    pub fn connect_active(&self, router: &mut dyn RouterHandle, quad: Quad, timeout: Duration) -> bool {
        let mut table = match self.lock() {
            Ok(t) => t,
            Err(_) => return false,
        };
        if let Some(slot) = table.connections.get(&quad) {
            if slot.conn.state == State::Open {
                return false;
            }
        }
        let config = table.config;
        let tx_wait = table.connections.get(&quad).map(|s| s.tx_wait.clone()).unwrap_or_else(|| Arc::new(Condvar::new()));
        let rx_wait = table.connections.get(&quad).map(|s| s.rx_wait.clone()).unwrap_or_else(|| Arc::new(Condvar::new()));

        for attempt in 0..2 {
            let now = Instant::now();
            let mut conn = Connection::connect_active(quad, config, now);
            conn.emit_syn(now, router);
            table.connections.insert(quad, Slot { conn, tx_wait: tx_wait.clone(), rx_wait: rx_wait.clone() });

            let (guard, result) = tx_wait
                .wait_timeout_while(table, timeout, |t| {
                    t.connections.get(&quad).map(|s| s.conn.state == State::SynSent).unwrap_or(false)
                })
                .expect("rdp lock poisoned");
            table = guard;
            let _ = result;

            match table.connections.get(&quad).map(|s| s.conn.state) {
                Some(State::Open) => return true,
                Some(State::SynSent) if attempt == 0 => continue,
                Some(State::SynSent) => {
                    if let Some(slot) = table.connections.get_mut(&quad) {
                        slot.conn.state = State::CloseWait;
                    }
                    return false;
                }
                _ => return false,
            }
        }
        false
    }

    /// §4.4 — blocking send, waiting on window credit.
    pub fn send(&self, router: &mut dyn RouterHandle, quad: Quad, payload: Vec<u8>, timeout: Duration) -> bool {
        let mut table = match self.lock() {
            Ok(t) => t,
            Err(_) => return false,
        };
        let tx_wait = match table.connections.get(&quad) {
            Some(s) => s.tx_wait.clone(),
            None => return false,
        };

        loop {
            match table.connections.get(&quad) {
                Some(slot) if slot.conn.state == State::Open && slot.conn.has_send_credit() => break,
                Some(slot) if slot.conn.state == State::Open => {}
                _ => return false,
            }

            let (guard, result) = match tx_wait.wait_timeout_while(table, timeout, |t| {
                t.connections
                    .get(&quad)
                    .map(|s| s.conn.state == State::Open && !s.conn.has_send_credit())
                    .unwrap_or(false)
            }) {
                Ok(v) => v,
                Err(_) => return false,
            };
            table = guard;
            if result.timed_out() {
                let still_blocked = table.connections.get(&quad).map(|s| !s.conn.has_send_credit()).unwrap_or(true);
                if still_blocked {
                    return false;
                }
            }
        }

        let now = Instant::now();
        match table.connections.get_mut(&quad) {
            Some(slot) => slot.conn.send(payload, now, router).is_ok(),
            None => false,
        }
    }

    /// Blocking receive, waiting for the next delivered application payload.
    pub fn recv(&self, quad: Quad, timeout: Duration) -> Option<Vec<u8>> {
        let mut table = self.lock().ok()?;
        let rx_wait = table.connections.get(&quad)?.rx_wait.clone();
        loop {
            match table.connections.get_mut(&quad) {
                Some(slot) => {
                    if let Some(data) = slot.conn.rx_app.pop_front() {
                        return Some(data);
                    }
                    if slot.conn.state == State::Closed {
                        return None;
                    }
                }
                None => return None,
            }
            let (guard, result) = rx_wait
                .wait_timeout_while(table, timeout, |t| {
                    t.connections.get(&quad).map(|s| s.conn.rx_app.is_empty() && s.conn.state != State::Closed).unwrap_or(false)
                })
                .ok()?;
            table = guard;
            if result.timed_out() {
                return None;
            }
        }
    }

    /// §4.9 — graceful close: first call sends RST+ACK and parks in
    /// CLOSE_WAIT, second call (or the linger timeout) removes the entry.
    pub fn close(&self, router: &mut dyn RouterHandle, quad: Quad) -> &'static str {
        let mut table = match self.lock() {
            Ok(t) => t,
            Err(_) => return "closed",
        };
        let now = Instant::now();
        match table.connections.get_mut(&quad) {
            Some(slot) if slot.conn.state != State::CloseWait => {
                slot.conn.send_rst_ack(router);
                slot.conn.state = State::CloseWait;
                slot.conn.open_timestamp = now;
                "graceful close pending"
            }
            Some(_) => {
                if let Some(slot) = table.connections.remove(&quad) {
                    slot.tx_wait.notify_all();
                    slot.rx_wait.notify_all();
                }
                "closed"
            }
            None => "closed",
        }
    }

    /// The router's ingress path: dispatch one received segment.
    pub fn new_packet(&self, router: &mut dyn RouterHandle, local: CspId, remote: CspId, bytes: Vec<u8>) -> Result<(), RdpError> {
        let (header, payload) = crate::wire::RdpHeader::decode(&bytes)?;
        let quad = Quad { src: local, dst: remote };
        let now = Instant::now();
        let mut table = self.lock()?;
        let config = table.config;

        if !table.connections.contains_key(&quad) {
            let bound = table.listeners.contains_key(&local.port);
            if !bound {
                if !header.rst {
                    let rst = crate::wire::RdpHeader { rst: true, eak: false, ack: true, syn: false, seq_nr: 0, ack_nr: header.seq_nr };
                    let mut out = Vec::new();
                    rst.append_to(&mut out);
                    let _ = router.send_direct(quad, out);
                }
                return Ok(());
            }
            table.connections.insert(
                quad,
                Slot {
                    conn: Connection::listen(quad, config, local.port, now),
                    tx_wait: Arc::new(Condvar::new()),
                    rx_wait: Arc::new(Condvar::new()),
                },
            );
        }

        let (tx_wait, rx_wait) = {
            let slot = table.connections.get(&quad).expect("just inserted or pre-existing");
            (slot.tx_wait.clone(), slot.rx_wait.clone())
        };

        let fx = {
            let slot = table.connections.get_mut(&quad).expect("checked above");
            slot.conn.on_segment(header, payload, now, router)
        };

        if fx.delivered {
            let port = table.connections.get_mut(&quad).and_then(|s| s.conn.pending_accept_port.take());
            if let Some(port) = port {
                if let Some(listener) = table.listeners.get_mut(&port) {
                    listener.backlog.push_back(quad);
                    listener.cvar.notify_one();
                }
            }
        }
        if fx.delivered || fx.peer_reset {
            rx_wait.notify_all();
        }
        if fx.wake_tx || fx.became_open {
            tx_wait.notify_all();
        }
        if fx.closed {
            table.connections.remove(&quad);
            tx_wait.notify_all();
            rx_wait.notify_all();
        }
        Ok(())
    }

    /// §4.8 — the maintenance sweep: idle reap, retransmits, delayed acks,
    /// producer wakeups. Run this periodically from whatever drives the
    /// router's event loop.
    pub fn check_timeouts(&self, router: &mut dyn RouterHandle) -> Result<(), RdpError> {
        let now = Instant::now();
        let mut table = self.lock()?;
        let config = table.config;

        let mut to_remove = Vec::new();
        for (quad, slot) in table.connections.iter() {
            let c = &slot.conn;
            let idle = now.duration_since(c.open_timestamp) > config.conn_timeout();
            let unaccepted_idle = !c.is_accepted() && idle;
            let close_wait_linger = c.state == State::CloseWait && idle;
            if unaccepted_idle || close_wait_linger {
                to_remove.push(*quad);
            }
        }
        for quad in &to_remove {
            if let Some(slot) = table.connections.remove(quad) {
                slot.tx_wait.notify_all();
                slot.rx_wait.notify_all();
            }
        }

        let mut to_wake = Vec::new();
        for (quad, slot) in table.connections.iter_mut() {
            slot.conn.retransmit_pass(now, router);
            slot.conn.delayed_ack_pass(now, router);
            if slot.conn.should_wake_producer() {
                to_wake.push(*quad);
            }
        }
        for quad in to_wake {
            if let Some(slot) = table.connections.get(&quad) {
                slot.tx_wait.notify_all();
            }
        }
        Ok(())
    }

    /// Pull the next established-but-unaccepted connection off a listener's
    /// backlog, blocking until one arrives or `timeout` elapses.
    pub fn accept(&self, port: CspPort, timeout: Duration) -> Option<Quad> {
        let mut table = self.lock().ok()?;
        let cvar = table.listeners.get(&port)?.cvar.clone();
        loop {
            match table.listeners.get_mut(&port) {
                Some(listener) => {
                    if let Some(quad) = listener.backlog.pop_front() {
                        return Some(quad);
                    }
                }
                None => return None,
            }
            let (guard, result) = cvar
                .wait_timeout_while(table, timeout, |t| {
                    t.listeners.get(&port).map(|l| l.backlog.is_empty()).unwrap_or(true)
                })
                .ok()?;
            table = guard;
            if result.timed_out() {
                return None;
            }
        }
    }
}
