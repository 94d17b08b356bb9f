use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use meshmap::net::{DatagramOptions, Options, DEFAULT_PACKET_SIZE};

pub const DEFAULT_PORT: u16 = 28800;

#[derive(Serialize, Deserialize)]
pub struct Node {
    /// Mesh identifier, 1..=127. Must be unique across the mesh.
    pub identifier: u8,
    pub entry_max_size: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Network {
    /// Port to accept peers on; omit for connect-only nodes.
    pub listen_port: Option<u16>,
    /// Peers this node dials, as `host:port`.
    pub peers: Vec<String>,
    pub packet_size: usize,
    pub heart_beat_interval_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
pub struct Udp {
    pub port: u16,
    pub broadcast_address: String,
}

#[derive(Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: Node,
    pub network: Network,
    pub udp: Option<Udp>,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            node: Node {
                identifier: 1,
                entry_max_size: 1024,
            },
            network: Network {
                listen_port: Some(DEFAULT_PORT),
                peers: Vec::new(),
                packet_size: DEFAULT_PACKET_SIZE,
                heart_beat_interval_ms: Some(1000),
            },
            udp: None,
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> NodeConfig {
        serdeconv::from_toml_file(path).expect("Error loading node configuration file")
    }

    /// Resolves the file-level configuration into engine options.
    pub fn to_options(&self) -> Options {
        let listen = self
            .network
            .listen_port
            .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));

        let peers = self
            .network
            .peers
            .iter()
            .map(|peer| resolve(peer))
            .collect();

        let datagram = self.udp.as_ref().map(|udp| DatagramOptions {
            port: udp.port,
            broadcast: resolve(&udp.broadcast_address),
        });

        Options {
            listen,
            peers,
            packet_size: self.network.packet_size,
            heartbeat: self.network.heart_beat_interval_ms.map(Duration::from_millis),
            datagram,
        }
    }
}

fn resolve(address: &str) -> SocketAddr {
    address
        .to_socket_addrs()
        .unwrap_or_else(|err| panic!("Unresolvable address {}: {}", address, err))
        .next()
        .unwrap_or_else(|| panic!("Unresolvable address {}", address))
}
