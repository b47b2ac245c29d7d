//! Drives a handshake, three payloads, and a graceful close between two
//! in-process peers over the loopback router, logging every state
//! transition. Run with `RUST_LOG=trace` to see the segments fly.
//!
//! Each side runs its own background thread pumping inbound segments
//! through `RdpContext::new_packet`, the same shape a real deployment's
//! router event loop would drive; the foreground thread only ever makes
//! blocking `connect`/`send`/`recv`/`close` calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rdp::addr::CspId;
use rdp::router::loopback;
use rdp::{new_context, RdpConfig, RdpConnection, RdpListener};

fn main() {
    env_logger::init();

    let (side_a, inbox_a, side_b, inbox_b) = loopback::pair();

    let client_ctx = new_context(RdpConfig::default());
    let server_ctx = new_context(RdpConfig::default());

    let client_id = CspId { addr: 1, port: 20 };
    let server_id = CspId { addr: 2, port: 20 };

    let running = Arc::new(AtomicBool::new(true));

    let client_pump = {
        let ctx = client_ctx.clone();
        let mut router = side_a.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Ok((_, bytes)) = inbox_a.recv_timeout(Duration::from_millis(20)) {
                    let _ = ctx.new_packet(&mut router, client_id, server_id, bytes);
                }
            }
        })
    };

    let server_pump = {
        let ctx = server_ctx.clone();
        let mut router = side_b.clone();
        let running = running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Ok((_, bytes)) = inbox_b.recv_timeout(Duration::from_millis(20)) {
                    let _ = ctx.new_packet(&mut router, server_id, client_id, bytes);
                }
            }
        })
    };

    let listener = RdpListener::bind(server_ctx, server_id.port).expect("bind");

    let mut connect_router = side_a.clone();
    let conn = RdpConnection::connect(client_ctx, &mut connect_router, client_id, server_id, Duration::from_secs(2))
        .expect("handshake should succeed over a lossless loopback");
    println!("client: connected {}", conn.quad());

    // The peer only posts a passively-opened connection to the listener's
    // backlog once its first payload has been delivered, so the first send
    // has to go out before `accept` has anything to return.
    assert!(conn.send(&mut connect_router, b"payload-0".to_vec(), Duration::from_secs(1)));

    let server_conn = listener.accept(server_id.addr, Duration::from_secs(1)).expect("accept");
    println!("server: accepted {}", server_conn.quad());
    let received = server_conn.recv(Duration::from_secs(1)).expect("first payload should arrive");
    println!("server: received {:?}", String::from_utf8_lossy(&received));

    for i in 1..3 {
        let payload = format!("payload-{i}").into_bytes();
        assert!(conn.send(&mut connect_router, payload, Duration::from_secs(1)));
        let received = server_conn.recv(Duration::from_secs(1)).expect("payload should arrive");
        println!("server: received {:?}", String::from_utf8_lossy(&received));
    }

    println!("client: close status = {}", conn.close(&mut connect_router));

    running.store(false, Ordering::Release);
    client_pump.join().ok();
    server_pump.join().ok();
}
