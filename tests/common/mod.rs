//! Shared harness for the end-to-end tests: a pair of hosts talking RDP over
//! an in-process loopback, each with its own background pump thread driving
//! `RdpContext::new_packet`, plus a router wrapper that can drop chosen
//! sequence numbers to exercise retransmission and EACK recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rdp::addr::{CspId, Quad};
use rdp::err::RdpError;
use rdp::router::{loopback::Loopback, RouterHandle};
use rdp::wire::RdpHeader;
use rdp::RdpContext;

/// Wraps a `Loopback` sender, optionally swallowing segments whose sequence
/// number appears in `drop_once`. Each listed sequence number is dropped
/// exactly once, simulating a single lost datagram.
#[derive(Clone)]
pub struct DroppingRouter {
    inner: Loopback,
    drop_once: Arc<Mutex<Vec<u16>>>,
}

impl DroppingRouter {
    pub fn new(inner: Loopback) -> Self {
        DroppingRouter { inner, drop_once: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn drop_seq_once(&self, seq: u16) {
        self.drop_once.lock().unwrap().push(seq);
    }
}

impl RouterHandle for DroppingRouter {
    fn send_direct(&mut self, quad: Quad, data: Vec<u8>) -> Result<(), RdpError> {
        if let Ok((header, _payload)) = RdpHeader::decode(&data) {
            let mut drops = self.drop_once.lock().unwrap();
            if let Some(pos) = drops.iter().position(|s| *s == header.seq_nr) {
                drops.remove(pos);
                return Ok(());
            }
        }
        self.inner.send_direct(quad, data)
    }
}

pub struct Host {
    pub ctx: RdpContext,
    pub id: CspId,
    pub router: DroppingRouter,
    running: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl Host {
    pub fn spawn(ctx: RdpContext, id: CspId, peer: CspId, outbound: Loopback, inbound: Receiver<(Quad, Vec<u8>)>) -> Host {
        let router = DroppingRouter::new(outbound);
        let running = Arc::new(AtomicBool::new(true));
        let pump = {
            let ctx = ctx.clone();
            let mut router = router.clone();
            let running = running.clone();
            thread::spawn(move || {
                while running.load(Ordering::Acquire) {
                    if let Ok((_, bytes)) = inbound.recv_timeout(Duration::from_millis(10)) {
                        let _ = ctx.new_packet(&mut router, id, peer, bytes);
                    }
                    let _ = ctx.check_timeouts(&mut router);
                }
            })
        };
        Host { ctx, id, router, running, pump: Some(pump) }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            pump.join().ok();
        }
    }
}

/// Build a connected pair of `Host`s with independent pump threads.
pub fn harness(client_id: CspId, server_id: CspId, config: rdp::RdpConfig) -> (Host, Host) {
    let (side_a, inbox_a, side_b, inbox_b) = rdp::router::loopback::pair();
    let client = Host::spawn(RdpContext::new(config), client_id, server_id, side_a, inbox_a);
    let server = Host::spawn(RdpContext::new(config), server_id, client_id, side_b, inbox_b);
    (client, server)
}
