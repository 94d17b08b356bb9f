use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use mio::net::TcpStream;

use ember::logging;
use ember::PeerId;

use crate::net::buffer::Buffer;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult};
use crate::net::wire;
use crate::store::{MapStore, ModificationIterator};

pub type ChannelId = usize;

/// Lifecycle of a session. `Connecting` lives in the reactor's connectors;
/// a channel exists only once a stream does. Bootstrap covers the window
/// between the remote's welcome and the reactor binding the modification
/// iterator (the reactor vets the identifier for collisions in between).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    Handshake(Instant),
    Bootstrap(PeerId),
    Replicating(PeerId),
    Disconnected,
}

/// One session with a remote peer over a non-blocking stream: welcome
/// exchange, then steady-state bidirectional replication. All I/O goes
/// through the inbound/outbound buffers; the socket is only ever touched
/// with non-blocking reads and writes.
pub struct Channel {
    id: Option<ChannelId>,

    stream: Option<TcpStream>,
    state: ChannelState,

    /// Remote's announced high-water timestamp, valid from Bootstrap on.
    remote_last_seen: u64,

    /// Bound at the end of bootstrap; yields the slots pending for the
    /// remote this session serves.
    iter: Option<Arc<ModificationIterator>>,

    last_egress: Instant,
    last_ingress: Instant,

    read_buffer: Buffer,
    write_buffer: Buffer,

    /// Scratch space for serializing one entry ahead of framing it.
    scratch: Vec<u8>,

    entry_max_size: usize,

    /// Index of the connector that produced this channel, if outbound.
    connector: Option<usize>,

    log: logging::Logger,
}

impl Channel {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        entry_max_size: usize,
        packet_size: usize,
        log: L,
    ) -> Channel {
        let now = Instant::now();

        let channel_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let capacity = packet_size + entry_max_size;

        Channel {
            id: None,
            stream: None,
            state: ChannelState::Disconnected,
            remote_last_seen: 0,
            iter: None,
            last_egress: now,
            last_ingress: now,
            read_buffer: Buffer::new(capacity),
            write_buffer: Buffer::new(capacity),
            scratch: Vec::with_capacity(entry_max_size),
            entry_max_size,
            connector: None,
            log: channel_log,
        }
    }

    /// Opens the channel on a freshly established stream and queues the
    /// welcome. The channel must be disconnected.
    pub fn open(
        &mut self,
        id: ChannelId,
        stream: TcpStream,
        connector: Option<usize>,
        map: &MapStore,
        now: Instant,
    ) {
        if self.state != ChannelState::Disconnected {
            panic!("Attempted to open an already open channel");
        }

        self.id = Some(id);
        self.stream = Some(stream);
        self.connector = connector;
        self.state = ChannelState::Handshake(now);
        self.last_egress = now;
        self.last_ingress = now;

        self.queue_welcome(map);

        logging::debug!(self.log, "channel opened"; "context" => "open", "channel_id" => id);
    }

    /// Closes the channel and the underlying stream, dropping any buffered
    /// data in both directions.
    pub fn close(&mut self) {
        logging::debug!(self.log, "closing channel";
                        "context" => "close",
                        "channel_id" => self.id,
                        "state" => ?self.state,
                        "read_size" => self.read_buffer.len(),
                        "write_size" => self.write_buffer.len());

        self.read_buffer.clear();
        self.write_buffer.clear();
        self.id = None;
        self.state = ChannelState::Disconnected;
        self.remote_last_seen = 0;
        self.iter = None;

        if let Some(stream) = self.stream.take() {
            drop(stream.shutdown(Shutdown::Both));
        }
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The remote's identifier, known from Bootstrap onward.
    #[inline]
    pub fn remote_identifier(&self) -> Option<PeerId> {
        match self.state {
            ChannelState::Bootstrap(remote) | ChannelState::Replicating(remote) => Some(remote),
            _ => None,
        }
    }

    #[inline]
    pub fn connector_index(&self) -> Option<usize> {
        self.connector
    }

    /// Returns the time elapsed since the last successful send.
    #[inline]
    pub fn last_egress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_egress)
    }

    /// Returns the time elapsed since bytes last arrived.
    #[inline]
    pub fn last_ingress_elapsed(&self, now: Instant) -> Duration {
        now.duration_since(self.last_ingress)
    }

    /// Registers the channel's stream on the supplied poll.
    pub fn register(&self, id: ChannelId, poll: &mio::Poll) -> NetworkResult<()> {
        poll.register(
            self.stream.as_ref().expect("Can't register a disconnected channel"),
            mio::Token(id),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters the channel's stream, if any.
    pub fn deregister(&self, poll: &mio::Poll) {
        if let Some(stream) = self.stream.as_ref() {
            drop(poll.deregister(stream));
        }
    }

    /// Half-closes the outbound direction, used during orderly shutdown.
    pub fn shutdown_write(&self) {
        if let Some(stream) = self.stream.as_ref() {
            drop(stream.shutdown(Shutdown::Write));
        }
    }

    /// Reads everything available off the stream and processes it: the
    /// welcome while handshaking, records while replicating. Returns the
    /// remote's identifier the moment its welcome is parsed, so the
    /// reactor can vet it before any record is processed; the caller calls
    /// back in once the bootstrap is complete to continue reading.
    pub fn receive(&mut self, now: Instant, map: &MapStore) -> NetworkResult<Option<PeerId>> {
        loop {
            let ingress = {
                let stream = self.stream.as_mut().expect("Channel must have a valid stream");
                self.read_buffer.ingress(stream).map_err(NetworkError::from)?
            };

            if ingress.received > 0 {
                self.last_ingress = now;
            }

            let buffered = self.read_buffer.len();

            if let Some(remote) = self.drain_inbound(map)? {
                // EOF behind the welcome resurfaces on the next read.
                return Ok(Some(remote));
            }

            if ingress.closed {
                return Err(NetworkError::Fatal(ErrorType::Disconnected));
            }

            let consumed = buffered - self.read_buffer.len();

            // A full buffer that extraction could not relieve holds a frame
            // that will never fit.
            if self.read_buffer.free_capacity() == 0 && consumed == 0 {
                return Err(NetworkError::Fatal(ErrorType::Oversized));
            }

            // Stop only on a pass that made no progress in either
            // direction, so a read stopped by a briefly full buffer always
            // returns to the socket before yielding.
            if ingress.received == 0 && consumed == 0 {
                return Ok(None);
            }
        }
    }

    /// Extracts and applies every complete record in the inbound buffer.
    /// While handshaking this consumes exactly the welcome and stops;
    /// anything after it stays buffered until the reactor finishes the
    /// bootstrap.
    fn drain_inbound(&mut self, map: &MapStore) -> NetworkResult<Option<PeerId>> {
        let mut welcomed = None;

        loop {
            match self.state {
                ChannelState::Handshake(_) => {
                    if self.read_buffer.len() < wire::WELCOME_SIZE {
                        break;
                    }

                    let (remote, last_seen) = wire::read_welcome(self.read_buffer.read_slice())?;

                    self.read_buffer.move_head(wire::WELCOME_SIZE);
                    self.remote_last_seen = last_seen;
                    self.state = ChannelState::Bootstrap(remote);
                    welcomed = Some(remote);

                    logging::debug!(self.log, "welcome received";
                                    "context" => "handshake",
                                    "channel_id" => self.id,
                                    "remote" => remote,
                                    "last_seen" => last_seen);
                    break;
                }
                ChannelState::Bootstrap(_) | ChannelState::Disconnected => break,
                ChannelState::Replicating(_) => {
                    let data = self.read_buffer.read_slice();

                    if data.len() < wire::RECORD_HEADER_SIZE {
                        break;
                    }

                    let length = BigEndian::read_u16(&data[..2]) as usize;

                    if length == 0 {
                        // Heartbeat; carries nothing.
                        self.read_buffer.move_head(wire::RECORD_HEADER_SIZE);
                        continue;
                    }

                    if length > self.entry_max_size {
                        return Err(NetworkError::Fatal(ErrorType::Oversized));
                    }

                    if data.len() < wire::RECORD_HEADER_SIZE + length {
                        break;
                    }

                    let frame = &data[wire::RECORD_HEADER_SIZE..wire::RECORD_HEADER_SIZE + length];
                    let entry = wire::read_entry(frame)?;

                    self.read_buffer.move_head(wire::RECORD_HEADER_SIZE + length);

                    match map.apply_incoming(entry) {
                        Ok(installed) => {
                            logging::trace!(self.log, "incoming entry";
                                            "context" => "replicate",
                                            "channel_id" => self.id,
                                            "installed" => installed);
                        }
                        Err(err) => {
                            // Storage refused the entry; drop it, keep the session.
                            logging::warn!(self.log, "dropping incoming entry";
                                           "context" => "replicate",
                                           "channel_id" => self.id,
                                           "error" => ?err);
                        }
                    }
                }
            }
        }

        Ok(welcomed)
    }

    /// Completes the bootstrap after the reactor accepted the remote's
    /// identifier: seeds the backlog from the remote's announced high-water
    /// mark, enters Replicating, and processes any records that arrived
    /// behind the welcome.
    pub fn replicate_from(
        &mut self,
        iter: Arc<ModificationIterator>,
        map: &MapStore,
    ) -> NetworkResult<()> {
        let remote = match self.state {
            ChannelState::Bootstrap(remote) => remote,
            state => panic!("Bootstrap completion in state {:?}", state),
        };

        iter.dirty_from(self.remote_last_seen);
        self.iter = Some(iter);
        self.state = ChannelState::Replicating(remote);

        logging::debug!(self.log, "session replicating";
                        "context" => "bootstrap",
                        "channel_id" => self.id,
                        "remote" => remote,
                        "since" => self.remote_last_seen);

        self.drain_inbound(map)?;
        Ok(())
    }

    /// Sends buffered outbound data to the stream.
    pub fn send(&mut self, now: Instant) -> NetworkResult<usize> {
        if self.write_buffer.is_empty() {
            return Ok(0);
        }

        let stream = self.stream.as_mut().expect("Channel must have a valid stream");
        let sent = self.write_buffer.egress(stream).map_err(NetworkError::from)?;

        if sent > 0 {
            self.last_egress = now;
        }

        Ok(sent)
    }

    /// Serializes one chunk of pending entries into the outbound buffer.
    /// The chunk ends when the iterator runs dry or the next worst-case
    /// record would not fit; the reactor gets control back in between so
    /// other sessions stay fair. Returns the number of records queued.
    pub fn fill(&mut self) -> usize {
        let iter = match (&self.state, &self.iter) {
            (ChannelState::Replicating(_), Some(iter)) => iter.clone(),
            _ => return 0,
        };

        let mut queued = 0;

        while self.write_buffer.free_capacity() >= wire::RECORD_HEADER_SIZE + self.entry_max_size {
            let scratch = &mut self.scratch;
            let write_buffer = &mut self.write_buffer;

            let delivered = iter.next_entry(|entry| {
                scratch.clear();
                wire::write_entry(&mut *scratch, entry).map_err(NetworkError::from)?;

                let mut header = [0u8; wire::RECORD_HEADER_SIZE];
                BigEndian::write_u16(&mut header, scratch.len() as u16);

                write_buffer.append(&header);
                write_buffer.append(scratch);

                Ok(scratch.len())
            });

            if !delivered {
                break;
            }

            queued += 1;
        }

        if queued > 0 {
            logging::trace!(self.log, "queued entry chunk";
                            "context" => "replicate",
                            "channel_id" => self.id,
                            "records" => queued);
        }

        queued
    }

    /// Flushes pending output; once drained, refills from the iterator and
    /// flushes again. One chunk per call.
    pub fn pump(&mut self, now: Instant) -> NetworkResult<()> {
        if !self.write_buffer.is_empty() {
            self.send(now)?;
        }

        if self.write_buffer.is_empty() && self.fill() > 0 {
            self.send(now)?;
        }

        Ok(())
    }

    /// Queues a zero-length heartbeat record, unless output is already
    /// pending (pending bytes serve the same liveness purpose).
    pub fn heartbeat(&mut self) {
        if !self.write_buffer.is_empty() || self.write_buffer.free_capacity() < wire::RECORD_HEADER_SIZE {
            return;
        }

        self.write_buffer.append(&[0, 0]);

        logging::trace!(self.log, "heartbeat queued"; "context" => "heartbeat", "channel_id" => self.id);
    }

    /// Returns true if there is outgoing data on the channel.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buffer.is_empty()
    }

    fn queue_welcome(&mut self, map: &MapStore) {
        let mut welcome = [0u8; wire::WELCOME_SIZE];

        wire::write_welcome(&mut &mut welcome[..], map.identifier(), map.last_modification())
            .expect("Welcome serialization cannot fail");

        self.write_buffer.append(&welcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::cmp;
    use std::mem;

    const ENTRY_MAX: usize = 256;
    const PACKET: usize = 1024;

    fn channel() -> Channel {
        let mut channel = Channel::new(ENTRY_MAX, PACKET, None);
        channel.state = ChannelState::Handshake(Instant::now());
        channel
    }

    /// Welcome exchange between two detached channels, moving bytes by
    /// swapping the outbound buffer of one into the inbound of the other.
    fn handshake(a: &mut Channel, map_a: &MapStore, b: &mut Channel, map_b: &MapStore) {
        a.queue_welcome(map_a);
        b.queue_welcome(map_b);

        mem::swap(&mut a.write_buffer, &mut b.read_buffer);
        mem::swap(&mut b.write_buffer, &mut a.read_buffer);

        let remote_b = a.drain_inbound(map_a).unwrap().unwrap();
        let remote_a = b.drain_inbound(map_b).unwrap().unwrap();

        a.replicate_from(map_a.modification_iterator(remote_b), map_a).unwrap();
        b.replicate_from(map_b.modification_iterator(remote_a), map_b).unwrap();
    }

    /// Moves everything `from` has queued into `to`'s inbound buffer and
    /// processes it.
    fn shuttle(from: &mut Channel, to: &mut Channel, to_map: &MapStore) {
        mem::swap(&mut from.write_buffer, &mut to.read_buffer);
        assert!(to.drain_inbound(to_map).unwrap().is_none());
    }

    #[test]
    fn test_welcome_exchange() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        assert_eq!(a.state(), ChannelState::Replicating(2));
        assert_eq!(b.state(), ChannelState::Replicating(1));
        assert_eq!(a.remote_identifier(), Some(2));
    }

    #[test]
    fn test_bootstrap_seeds_backlog() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);

        // Mutations made before the peer ever connected.
        map_a.put(b"one", b"EXAMPLE-1").unwrap();
        map_a.put(b"two", b"EXAMPLE-2").unwrap();

        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        assert!(a.fill() > 0);
        shuttle(&mut a, &mut b, &map_b);

        assert_eq!(map_b.snapshot(), map_a.snapshot());
    }

    #[test]
    fn test_replication_both_directions() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        map_a.put(b"from-a", b"1").unwrap();
        map_b.put(b"from-b", b"2").unwrap();
        map_b.remove(b"missing").unwrap();

        a.fill();
        b.fill();
        shuttle(&mut a, &mut b, &map_b);
        shuttle(&mut b, &mut a, &map_a);

        assert_eq!(map_a.snapshot(), map_b.snapshot());
        assert_eq!(map_a.get(b"from-b"), Some(b"2".to_vec()));
        assert_eq!(map_b.get(b"from-a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_fill_respects_buffer_budget() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        // More entries than one outbound buffer can hold.
        let value = vec![7u8; 200];
        for index in 0..64u8 {
            map_a.put(&[index], &value).unwrap();
        }

        let mut rounds = 0;
        loop {
            let queued = a.fill();
            if queued == 0 {
                break;
            }

            // The chunk must stop before overflowing the buffer.
            assert!(a.write_buffer.free_capacity() < wire::RECORD_HEADER_SIZE + ENTRY_MAX);

            shuttle(&mut a, &mut b, &map_b);
            rounds += 1;
        }

        assert!(rounds > 1);
        assert_eq!(map_b.snapshot(), map_a.snapshot());
    }

    #[test]
    fn test_inbound_heartbeat_consumed() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        b.read_buffer.append(&[0, 0]);
        b.drain_inbound(&map_b).unwrap();

        assert!(b.read_buffer.is_empty());
        assert!(map_b.is_empty());
    }

    #[test]
    fn test_heartbeat_skipped_while_output_pending() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let mut a = channel();

        a.queue_welcome(&map_a);
        let pending = a.write_buffer.len();

        a.heartbeat();

        assert_eq!(a.write_buffer.len(), pending);
    }

    #[test]
    fn test_oversized_record_is_fatal() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        let mut header = [0u8; 2];
        BigEndian::write_u16(&mut header, (ENTRY_MAX + 1) as u16);
        b.read_buffer.append(&header);

        assert_eq!(
            b.drain_inbound(&map_b),
            Err(NetworkError::Fatal(ErrorType::Oversized))
        );
    }

    #[test]
    fn test_malformed_record_is_fatal() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        // Declared length 3, but an entry needs at least 12 bytes.
        b.read_buffer.append(&[0, 3, 1, 2, 3]);

        assert_eq!(
            b.drain_inbound(&map_b),
            Err(NetworkError::Fatal(ErrorType::Malformed))
        );
    }

    #[test]
    fn test_rejected_welcome_identifier() {
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut b = channel();

        let mut welcome = [0u8; wire::WELCOME_SIZE];
        welcome[0] = 200;
        b.read_buffer.append(&welcome);

        assert_eq!(
            b.drain_inbound(&map_b),
            Err(NetworkError::Fatal(ErrorType::HandshakeRejected))
        );
    }

    #[test]
    fn test_chopped_stream_replays_identically() {
        // Property: any chopping of the byte stream into arbitrary chunks
        // yields the same applied records.
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        for index in 0..32u8 {
            map_a.put(&[index], &[index, index]).unwrap();
        }
        map_a.remove(&[7]).unwrap();

        // Serialize everything into one contiguous stream, with heartbeats
        // sprinkled in between records.
        let mut stream = Vec::new();
        loop {
            let before = stream.len();
            a.fill();
            stream.extend_from_slice(a.write_buffer.read_slice());
            let drained = a.write_buffer.len();
            a.write_buffer.move_head(drained);

            if stream.len() == before {
                break;
            }

            stream.extend_from_slice(&[0, 0]);
        }

        let mut rng = rand::thread_rng();
        let mut fed = 0;

        while fed < stream.len() {
            let chunk = rng.gen_range(1..=cmp::min(64, stream.len() - fed));
            b.read_buffer.append(&stream[fed..fed + chunk]);
            fed += chunk;

            b.drain_inbound(&map_b).unwrap();
        }

        assert_eq!(map_b.snapshot(), map_a.snapshot());
        assert_eq!(map_b.get(&[7]), None);
    }

    #[test]
    fn test_close_resets_session() {
        let map_a = MapStore::new(1, ENTRY_MAX);
        let map_b = MapStore::new(2, ENTRY_MAX);
        let mut a = channel();
        let mut b = channel();

        handshake(&mut a, &map_a, &mut b, &map_b);

        map_a.put(b"k", b"v").unwrap();
        a.fill();
        a.close();

        assert_eq!(a.state(), ChannelState::Disconnected);
        assert!(!a.has_egress());
        assert_eq!(a.remote_identifier(), None);

        // An entry consumed into the dropped buffer is recovered on
        // reconnect: the remote's welcome re-seeds everything it missed.
        let iter = map_a.modification_iterator(2);
        assert!(!iter.has_work());
        iter.dirty_from(0);
        assert!(iter.has_work());
    }
}
