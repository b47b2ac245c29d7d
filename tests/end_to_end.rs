mod common;

use std::time::Duration;

use common::harness;
use rdp::addr::CspId;
use rdp::{RdpConfig, RdpConnection, RdpContext, RdpListener};

fn ids() -> (CspId, CspId) {
    (CspId { addr: 1, port: 30 }, CspId { addr: 2, port: 30 })
}

fn small_window_config() -> RdpConfig {
    RdpConfig { window_size: 5, ..RdpConfig::default() }
}

/// Scenario 1: a plain active-open/passive-open handshake completes and
/// both sides land in OPEN with the sequence numbers the fixed ISS values
/// imply.
#[test]
fn handshake_completes_with_fixed_iss() {
    let (client_id, server_id) = ids();
    let (client, server) = harness(client_id, server_id, small_window_config());
    let _listener = RdpListener::bind(server.ctx.clone(), server_id.port).expect("bind");

    let mut router = client.router.clone();
    let conn = RdpConnection::connect(client.ctx.clone(), &mut router, client_id, server_id, Duration::from_secs(2))
        .expect("handshake should succeed over a lossless loopback");
    assert_eq!(conn.quad().src, client_id);
    assert_eq!(conn.quad().dst, server_id);
}

/// Scenario 2: three in-order payloads are delivered to the application in
/// the order they were sent.
#[test]
fn three_in_order_payloads_are_delivered_in_order() {
    let (client_id, server_id) = ids();
    let (client, server) = harness(client_id, server_id, small_window_config());
    let listener = RdpListener::bind(server.ctx.clone(), server_id.port).expect("bind");

    let mut router = client.router.clone();
    let conn = RdpConnection::connect(client.ctx.clone(), &mut router, client_id, server_id, Duration::from_secs(2)).expect("handshake");

    assert!(conn.send(&mut router, b"one".to_vec(), Duration::from_secs(1)));
    let server_conn = listener.accept(server_id.addr, Duration::from_secs(1)).expect("accept");
    assert_eq!(server_conn.recv(Duration::from_secs(1)).unwrap(), b"one");

    assert!(conn.send(&mut router, b"two".to_vec(), Duration::from_secs(1)));
    assert_eq!(server_conn.recv(Duration::from_secs(1)).unwrap(), b"two");

    assert!(conn.send(&mut router, b"three".to_vec(), Duration::from_secs(1)));
    assert_eq!(server_conn.recv(Duration::from_secs(1)).unwrap(), b"three");
}

/// Scenario 3: the middle packet of a three-packet burst is dropped once;
/// the receiver buffers the out-of-order tail and answers with an EACK,
/// and the retransmit timer's resend completes delivery in order, with
/// nothing duplicated or lost.
#[test]
fn a_single_drop_recovers_via_eack_and_retransmission() {
    let (client_id, server_id) = ids();
    let config = RdpConfig { window_size: 5, packet_timeout_ms: 100, ..RdpConfig::default() };
    let (client, server) = harness(client_id, server_id, config);
    let listener = RdpListener::bind(server.ctx.clone(), server_id.port).expect("bind");

    let mut router = client.router.clone();
    let conn = RdpConnection::connect(client.ctx.clone(), &mut router, client_id, server_id, Duration::from_secs(2)).expect("handshake");

    // The first data segment after the handshake carries seq_nr 1001 (the
    // active opener's snd_nxt right after its SYN at 1000).
    client.router.drop_seq_once(1001);

    assert!(conn.send(&mut router, b"first".to_vec(), Duration::from_secs(1)));
    assert!(conn.send(&mut router, b"second".to_vec(), Duration::from_secs(1)));

    let server_conn = listener.accept(server_id.addr, Duration::from_secs(2)).expect("accept");
    assert_eq!(server_conn.recv(Duration::from_secs(2)).unwrap(), b"first");
    assert_eq!(server_conn.recv(Duration::from_secs(2)).unwrap(), b"second");
}

/// Scenario 4: the initiator's first attempt gets a bare ACK back (a
/// half-open peer) instead of SYN+ACK; it resets and retries once, and a
/// peer that answers properly on the second SYN lets the connect succeed.
#[test]
fn half_open_bare_ack_triggers_a_retry() {
    use rdp::router::RouterHandle;
    use rdp::wire::{RdpHeader, SynParams};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let (client_id, server_id) = ids();
    let (mut client_out, client_inbox, mut scripted_out, server_inbox) = rdp::router::loopback::pair();
    let ctx = RdpContext::new(small_window_config());

    let running = Arc::new(AtomicBool::new(true));
    let client_pump = {
        let ctx = ctx.clone();
        let running = running.clone();
        let mut router = client_out.clone();
        std::thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Ok((_, bytes)) = client_inbox.recv_timeout(Duration::from_millis(10)) {
                    let _ = ctx.new_packet(&mut router, client_id, server_id, bytes);
                }
            }
        })
    };

    let connect_thread = {
        let ctx = ctx.clone();
        std::thread::spawn(move || RdpConnection::connect(ctx, &mut client_out, client_id, server_id, Duration::from_secs(2)))
    };

    let (_quad, bytes) = server_inbox.recv_timeout(Duration::from_secs(1)).expect("first SYN");
    let (header, _payload) = RdpHeader::decode(&bytes).unwrap();
    assert!(header.syn && !header.ack);
    let bare_ack = RdpHeader { rst: false, eak: false, ack: true, syn: false, seq_nr: 0, ack_nr: header.seq_nr };
    let mut out = Vec::new();
    bare_ack.append_to(&mut out);
    scripted_out.send_direct(rdp::Quad { src: server_id, dst: client_id }, out).unwrap();

    let (_quad, bytes) = server_inbox.recv_timeout(Duration::from_secs(1)).expect("retry SYN");
    let (header, payload) = RdpHeader::decode(&bytes).unwrap();
    assert!(header.syn);
    let _ = SynParams::decode(payload).unwrap();
    let synack = RdpHeader { rst: false, eak: false, ack: true, syn: true, seq_nr: 2000, ack_nr: header.seq_nr };
    let mut out = Vec::new();
    synack.append_to(&mut out);
    scripted_out.send_direct(rdp::Quad { src: server_id, dst: client_id }, out).unwrap();

    let conn = connect_thread.join().unwrap().expect("second attempt should succeed");
    assert_eq!(conn.quad().dst, server_id);

    running.store(false, Ordering::Release);
    client_pump.join().ok();
}

/// Scenario 5: a graceful close needs two calls — the first parks the
/// connection in CLOSE_WAIT, the second (after the peer's RST+ACK has been
/// observed) finishes the teardown.
#[test]
fn graceful_close_is_a_two_step_handshake() {
    let (client_id, server_id) = ids();
    let (client, server) = harness(client_id, server_id, small_window_config());
    let _listener = RdpListener::bind(server.ctx.clone(), server_id.port).expect("bind");

    let mut router = client.router.clone();
    let conn = RdpConnection::connect(client.ctx.clone(), &mut router, client_id, server_id, Duration::from_secs(2)).expect("handshake");

    let first = conn.close(&mut router);
    assert_eq!(first, "graceful close pending");

    std::thread::sleep(Duration::from_millis(50));
    let second = conn.close(&mut router);
    assert_eq!(second, "closed");
}

/// Scenario 6: once the send window fills, `send` blocks until the peer's
/// acknowledgements free up credit, rather than failing or panicking.
#[test]
fn send_blocks_on_a_full_window_until_credit_frees() {
    let (client_id, server_id) = ids();
    let config = RdpConfig { window_size: 2, ..RdpConfig::default() };
    let (client, server) = harness(client_id, server_id, config);
    let listener = RdpListener::bind(server.ctx.clone(), server_id.port).expect("bind");

    let mut router = client.router.clone();
    let conn = RdpConnection::connect(client.ctx.clone(), &mut router, client_id, server_id, Duration::from_secs(2)).expect("handshake");

    assert!(conn.send(&mut router, b"a".to_vec(), Duration::from_secs(1)));
    let server_conn = listener.accept(server_id.addr, Duration::from_secs(1)).expect("accept");
    assert_eq!(server_conn.recv(Duration::from_secs(1)).unwrap(), b"a");

    // With window_size=2 this call may have to wait for the ACK generated
    // by the first recv above before credit frees up; it must still
    // complete well inside the timeout rather than fail.
    assert!(conn.send(&mut router, b"b".to_vec(), Duration::from_secs(2)));
    assert_eq!(server_conn.recv(Duration::from_secs(1)).unwrap(), b"b");
}
