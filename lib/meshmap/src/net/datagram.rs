//! Best-effort datagram replication alongside the reliable mesh. One entry
//! per packet, no retransmit, no acknowledgment; a corrupt packet is
//! dropped without a trace beyond a log line. Convergence is only
//! guaranteed when the reliable channel is configured as well.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use mio;
use mio::net::UdpSocket;

use ember::logging;

use crate::net::shared::{NetworkError, NetworkResult};
use crate::net::wire;
use crate::net::DatagramOptions;
use crate::store::{MapStore, ModificationIterator, DATAGRAM_ID};

const SOCKET_TOKEN: mio::Token = mio::Token(0);
const WAKE_TOKEN: mio::Token = mio::Token(1);

const TICK: Duration = Duration::from_millis(50);

/// Guard and length prefix in front of every packet.
const PACKET_HEADER_SIZE: usize = 4;

/// The datagram loop: broadcasts locally mutated entries and applies
/// guarded packets received from other nodes. Runs on its own thread with
/// its own poll.
pub struct DatagramLoop {
    map: MapStore,
    socket: UdpSocket,
    broadcast: SocketAddr,

    /// Private cursor over local mutations, bound to the reserved
    /// datagram identifier.
    iter: Arc<ModificationIterator>,

    poll: mio::Poll,
    events: mio::Events,
    _wake: mio::Registration,

    /// Scratch for one outbound packet.
    packet: Vec<u8>,
    /// Scratch for one inbound packet.
    inbound: Vec<u8>,

    log: logging::Logger,
}

impl DatagramLoop {
    pub fn new(
        map: MapStore,
        options: &DatagramOptions,
        log: &logging::Logger,
    ) -> NetworkResult<(DatagramLoop, mio::SetReadiness)> {
        let bind: SocketAddr = format!("0.0.0.0:{}", options.port).parse()?;
        let socket = UdpSocket::bind(&bind)?;
        socket.set_broadcast(true)?;

        let poll = mio::Poll::new()?;
        poll.register(&socket, SOCKET_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let (wake, wake_readiness) = mio::Registration::new2();
        poll.register(&wake, WAKE_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let capacity = PACKET_HEADER_SIZE + map.entry_max_size();
        let iter = map.modification_iterator(DATAGRAM_ID);

        let datagram = DatagramLoop {
            map,
            socket,
            broadcast: options.broadcast,
            iter,
            poll,
            events: mio::Events::with_capacity(256),
            _wake: wake,
            packet: Vec::with_capacity(capacity),
            inbound: vec![0u8; capacity],
            log: log.new(logging::o!()),
        };

        Ok((datagram, wake_readiness))
    }

    /// The bound socket address (for port-0 binds).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    /// Runs until the flag drops. Each pass broadcasts pending mutations
    /// and applies whatever arrived.
    pub fn run(&mut self, running: &AtomicBool) {
        logging::info!(self.log, "datagram replication started";
                       "context" => "run", "broadcast" => %self.broadcast);

        while running.load(Ordering::Acquire) {
            self.transmit();

            self.poll
                .poll(&mut self.events, Some(TICK))
                .expect("Readiness wait failed");

            let mut readable = false;
            for event in &self.events {
                if event.token() == SOCKET_TOKEN && event.readiness().is_readable() {
                    readable = true;
                }
            }

            if readable {
                self.receive();
            }
        }

        logging::info!(self.log, "datagram replication stopped"; "context" => "run");
    }

    /// Drains the private iterator, one entry per datagram. A send that
    /// would block declines the entry so the bit is restored and retried
    /// on a later pass.
    fn transmit(&mut self) {
        loop {
            let packet = &mut self.packet;
            let socket = &self.socket;
            let broadcast = &self.broadcast;

            let delivered = self.iter.next_entry(|entry| {
                packet.clear();
                packet.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
                wire::write_entry(&mut *packet, entry).map_err(NetworkError::from)?;

                let length = (packet.len() - PACKET_HEADER_SIZE) as u16;
                BigEndian::write_u16(&mut packet[..2], !length);
                BigEndian::write_u16(&mut packet[2..4], length);

                match socket.send_to(packet, broadcast) {
                    Ok(_) => Ok(packet.len()),
                    Err(err) => Err(NetworkError::from(err)),
                }
            });

            if !delivered {
                break;
            }
        }
    }

    /// Applies every packet waiting on the socket.
    fn receive(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.inbound) {
                Ok((size, from)) => self.apply_packet(size, from),
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "datagram receive failed";
                                   "context" => "receive", "error" => %err);
                    break;
                }
            }
        }
    }

    /// Validates the guard and applies the payload. Every mismatch drops
    /// the packet silently; this channel owes nobody an answer.
    fn apply_packet(&mut self, size: usize, from: SocketAddr) {
        let data = &self.inbound[..size];

        if size < PACKET_HEADER_SIZE {
            logging::trace!(self.log, "dropping truncated datagram";
                            "context" => "receive", "from" => %from, "size" => size);
            return;
        }

        let guard = BigEndian::read_u16(&data[..2]);
        let length = BigEndian::read_u16(&data[2..4]);

        if guard != !length || size - PACKET_HEADER_SIZE != length as usize {
            logging::trace!(self.log, "dropping datagram with bad guard";
                            "context" => "receive", "from" => %from);
            return;
        }

        let entry = match wire::read_entry(&data[PACKET_HEADER_SIZE..]) {
            Ok(entry) => entry,
            Err(_) => {
                logging::trace!(self.log, "dropping undecodable datagram";
                                "context" => "receive", "from" => %from);
                return;
            }
        };

        match self.map.apply_incoming(entry) {
            Ok(installed) => {
                logging::trace!(self.log, "datagram entry";
                                "context" => "receive", "from" => %from, "installed" => installed);
            }
            Err(err) => {
                logging::warn!(self.log, "dropping datagram entry";
                               "context" => "receive", "from" => %from, "error" => ?err);
            }
        }
    }
}
