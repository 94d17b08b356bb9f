//! Datagram channel scenarios: best-effort propagation and the
//! inverted-length guard.

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use ember::logging::{o, Discard, Logger};
use meshmap::net::wire;
use meshmap::net::{DatagramOptions, Options};
use meshmap::replicator::Replicator;
use meshmap::store::{Entry, MapStore};

const DEADLINE: Duration = Duration::from_secs(10);

fn quiet() -> Logger {
    Logger::root(Discard, o!())
}

fn datagram_node(identifier: u8, broadcast: SocketAddr) -> (MapStore, Replicator) {
    let map = MapStore::new(identifier, 1024);

    let options = Options {
        datagram: Some(DatagramOptions { port: 0, broadcast }),
        ..Options::default()
    };

    let replicator = Replicator::start(map.clone(), options, &quiet()).unwrap();

    (map, replicator)
}

fn settles<F: Fn() -> bool>(condition: F, deadline: Duration) -> bool {
    let until = Instant::now() + deadline;

    while Instant::now() < until {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(25));
    }

    condition()
}

fn packet(entry: &Entry, corrupt_guard: bool) -> Vec<u8> {
    let mut payload = Vec::new();
    wire::write_entry(&mut payload, entry).unwrap();

    let length = payload.len() as u16;
    let guard = if corrupt_guard { !length ^ 0x0101 } else { !length };

    let mut packet = Vec::new();
    packet.extend_from_slice(&guard.to_be_bytes());
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&payload);
    packet
}

#[test]
fn best_effort_propagation() {
    // B listens; its own broadcast target points at a dead port.
    let (map_b, rep_b) = datagram_node(2, "127.0.0.1:9".parse().unwrap());
    let target: SocketAddr = format!("127.0.0.1:{}", rep_b.datagram_addr().unwrap().port())
        .parse()
        .unwrap();

    // A broadcasts every mutation at B. No reliable channel anywhere.
    let (map_a, _rep_a) = datagram_node(1, target);

    map_a.put(b"5", b"EXAMPLE-2").unwrap();

    assert!(settles(|| map_b.get(b"5") == Some(b"EXAMPLE-2".to_vec()), DEADLINE));
}

#[test]
fn guard_mismatch_is_dropped() {
    let (map_b, rep_b) = datagram_node(2, "127.0.0.1:9".parse().unwrap());
    let target: SocketAddr = format!("127.0.0.1:{}", rep_b.datagram_addr().unwrap().port())
        .parse()
        .unwrap();

    let probe = UdpSocket::bind("127.0.0.1:0").unwrap();

    let entry = Entry {
        key: b"poison".to_vec().into_boxed_slice(),
        value: Some(b"x".to_vec().into_boxed_slice()),
        timestamp: 1_000_000,
        modifier: 3,
    };

    probe.send_to(&packet(&entry, true), target).unwrap();

    thread::sleep(Duration::from_millis(400));
    assert!(map_b.is_empty());

    // The same entry with an intact guard goes through, proving the drop
    // above was the guard's doing.
    probe.send_to(&packet(&entry, false), target).unwrap();

    assert!(settles(|| map_b.get(b"poison") == Some(b"x".to_vec()), DEADLINE));
}
