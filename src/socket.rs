//! User-facing handles: `RdpListener` and `RdpConnection`. Thin wrappers
//! over `RdpContext` that present a blocking accept/send/recv/close
//! surface, in the spirit of `TcpListener`/`TcpStream` but without
//! pretending to implement `std::io::Read`/`Write` — RDP is
//! message-oriented, not a byte stream.

use std::time::Duration;

use crate::addr::{CspId, CspPort, Quad};
use crate::config::RdpConfig;
use crate::err::RdpError;
use crate::manager::RdpContext;
use crate::router::RouterHandle;

/// A bound listening port, yielding established connections via `accept`.
pub struct RdpListener {
    ctx: RdpContext,
    port: CspPort,
}

impl RdpListener {
    pub fn bind(ctx: RdpContext, port: CspPort) -> Result<RdpListener, RdpError> {
        ctx.bind(port)?;
        Ok(RdpListener { ctx, port })
    }

    /// Block until a passively-opened connection has delivered its first
    /// payload, or `timeout` elapses.
    pub fn accept(&self, local_addr: u16, timeout: Duration) -> Option<RdpConnection> {
        let quad = self.ctx.accept(self.port, timeout)?;
        debug_assert_eq!(quad.src, CspId { addr: local_addr, port: self.port });
        Some(RdpConnection { ctx: self.ctx.clone(), quad })
    }
}

impl Drop for RdpListener {
    fn drop(&mut self) {
        let _ = self.ctx.unbind(self.port);
    }
}

/// One side of an established (or still-handshaking) connection.
pub struct RdpConnection {
    ctx: RdpContext,
    quad: Quad,
}

impl RdpConnection {
    /// §4.2 — actively open a connection to `remote`, using `local` as this
    /// host's source address/port.
    pub fn connect(
        ctx: RdpContext,
        router: &mut dyn RouterHandle,
        local: CspId,
        remote: CspId,
        timeout: Duration,
    ) -> Option<RdpConnection> {
        let quad = Quad { src: local, dst: remote };
        ctx.allocate(quad).ok()?;
        if ctx.connect_active(router, quad, timeout) {
            Some(RdpConnection { ctx, quad })
        } else {
            None
        }
    }

    pub fn quad(&self) -> Quad {
        self.quad
    }

    pub fn send(&self, router: &mut dyn RouterHandle, payload: Vec<u8>, timeout: Duration) -> bool {
        self.ctx.send(router, self.quad, payload, timeout)
    }

    pub fn recv(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.ctx.recv(self.quad, timeout)
    }

    /// §4.9 — first call requests a graceful close; once the peer's RST+ACK
    /// has been observed (or the linger timeout fires via
    /// `RdpContext::check_timeouts`), a second call finishes the teardown.
    pub fn close(&self, router: &mut dyn RouterHandle) -> &'static str {
        self.ctx.close(router, self.quad)
    }
}

/// Convenience constructor mirroring `rdp_set_opt` from the external
/// interface: build a context whose future active/passive opens default to
/// `config`.
pub fn new_context(config: RdpConfig) -> RdpContext {
    RdpContext::new(config)
}
