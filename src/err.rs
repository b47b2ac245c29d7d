#[derive(Debug, thiserror::Error)]
pub enum RdpError {
    #[error("no free connection slots")]
    ResourceExhausted,

    #[error("peer sent a malformed segment: {0}")]
    ProtocolViolation(&'static str),

    #[error("timed out waiting for the RDP lock")]
    LockTimeout,

    #[error("connection was reset by the peer")]
    ConnectionReset,

    #[error("connect attempt timed out")]
    ConnectTimeout,

    #[error("port {0} already in use")]
    PortInUse(u8),

    #[error("no such connection")]
    NoSuchConnection,
}
