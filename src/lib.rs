//! A Reliable Datagram Protocol core for small, single-process CSP stacks:
//! a TCP-like connection-oriented layer (handshake, ordered delivery,
//! selective retransmission) sitting on top of an unreliable, out-of-order
//! datagram router.
//!
//! Routing, the link layer, and port demultiplexing below this layer are
//! out of scope — see [`router::RouterHandle`] for the narrow interface
//! this crate expects from whatever supplies them.

pub mod addr;
pub mod config;
pub mod err;
mod manager;
pub mod router;
pub mod socket;
pub mod tcb;
pub mod wire;

pub use addr::{CspAddress, CspId, CspPort, Quad};
pub use config::{RdpConfig, CSP_RDP_MAX_WINDOW};
pub use err::RdpError;
pub use manager::RdpContext;
pub use socket::{new_context, RdpConnection, RdpListener};
