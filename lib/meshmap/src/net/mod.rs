//! Networking for the replication mesh: wire format, buffered non-blocking
//! sessions, the single-threaded reactor, and the optional best-effort
//! datagram channel.

use std::net::SocketAddr;
use std::time::Duration;

pub mod buffer;
pub mod channel;
pub mod datagram;
pub mod endpoint;
pub mod shared;
pub mod wire;

/// Default outbound/inbound packet budget per session.
pub const DEFAULT_PACKET_SIZE: usize = 8192;

/// Mesh configuration handed to `Replicator::start`. The node identifier
/// and entry size ceiling live on the `MapStore` itself.
#[derive(Debug, Clone)]
pub struct Options {
    /// Address to accept peers on; `None` for connect-only nodes.
    pub listen: Option<SocketAddr>,

    /// Peers this node dials. Each mesh link needs one configured
    /// direction; replication itself is bidirectional.
    pub peers: Vec<SocketAddr>,

    /// Per-session buffer budget; every session buffer holds
    /// `packet_size + entry_max_size` bytes.
    pub packet_size: usize,

    /// Heartbeat interval: quiet sessions emit a zero-length record after
    /// one interval and are closed after two silent intervals. `None`
    /// disables both.
    pub heartbeat: Option<Duration>,

    /// Optional best-effort datagram channel.
    pub datagram: Option<DatagramOptions>,
}

#[derive(Debug, Clone)]
pub struct DatagramOptions {
    /// Local port the datagram socket binds to (0 for ephemeral).
    pub port: u16,

    /// Destination every mutation is broadcast to.
    pub broadcast: SocketAddr,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            listen: None,
            peers: Vec::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            heartbeat: None,
            datagram: None,
        }
    }
}
