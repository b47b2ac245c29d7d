use std::fmt;

/// A CSP node address. Real CSP networks are small (a handful of nodes per
/// bus), so this stays a plain integer rather than anything IP-shaped.
pub type CspAddress = u16;

/// A CSP port number (traditionally 0-63, but this crate only needs it to be
/// hashable and copyable).
pub type CspPort = u8;

/// One endpoint of a connection: a node address plus the port on that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CspId {
    pub addr: CspAddress,
    pub port: CspPort,
}

impl fmt::Display for CspId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// The 4-tuple identifying a connection. `src` is always this host's local
/// endpoint and `dst` the remote peer's, regardless of which side dialed —
/// this keeps `RouterHandle::send_direct` unambiguous (always local -> remote)
/// and makes the pair a stable hash key per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub src: CspId,
    pub dst: CspId,
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.src, self.dst)
    }
}
