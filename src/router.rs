//! The boundary between RDP and the rest of the CSP stack.
//!
//! The router, link layer, routing table, and port demultiplexing all live
//! outside this crate in a real deployment. `RouterHandle` is the narrow
//! interface RDP needs from that world: hand a connection's 4-tuple and a
//! fully framed segment to whatever gets it to the peer.

use crate::addr::Quad;
use crate::err::RdpError;

pub trait RouterHandle: Send {
    /// Transmit `data` from `quad.src` to `quad.dst`, bypassing any routing
    /// decision the caller hasn't already made.
    fn send_direct(&mut self, quad: Quad, data: Vec<u8>) -> Result<(), RdpError>;
}

/// An in-process loopback pair, useful for driving the state machine in
/// tests without a real router, link layer, or second host.
#[cfg(any(test, feature = "loopback"))]
pub mod loopback {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender};

    #[derive(Clone)]
    pub struct Loopback {
        pub inbox: Sender<(Quad, Vec<u8>)>,
    }

    impl RouterHandle for Loopback {
        fn send_direct(&mut self, quad: Quad, data: Vec<u8>) -> Result<(), RdpError> {
            self.inbox
                .send((quad, data))
                .map_err(|_| RdpError::ProtocolViolation("loopback peer dropped"))
        }
    }

    /// Build a connected pair of loopback handles: `(side_a, inbox_a, side_b, inbox_b)`.
    /// Sending through `side_a` delivers into `inbox_b` and vice versa.
    pub fn pair() -> (Loopback, Receiver<(Quad, Vec<u8>)>, Loopback, Receiver<(Quad, Vec<u8>)>) {
        let (tx_to_b, inbox_b) = std::sync::mpsc::channel();
        let (tx_to_a, inbox_a) = std::sync::mpsc::channel();
        (Loopback { inbox: tx_to_b }, inbox_a, Loopback { inbox: tx_to_a }, inbox_b)
    }
}
