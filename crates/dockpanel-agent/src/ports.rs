use std::net::TcpListener;

pub trait PortProber: Send + Sync {
    /// `true` when something on this host already listens on `port`.
    fn in_use(&self, port: u16) -> bool;
}

/// Probes by binding the wildcard address; a failed bind means the port is taken.
#[derive(Clone, Default)]
pub struct TcpPortProber;

impl PortProber for TcpPortProber {
    fn in_use(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_err()
    }
}
