use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use indexmap::IndexSet;
use mio;
use mio::net::{TcpListener, TcpStream};

use ember::logging;
use ember::PeerId;

use crate::net::channel::{Channel, ChannelId, ChannelState};
use crate::net::shared::{ErrorType, ErrorUtils, NetworkResult};
use crate::net::Options;
use crate::store::MapStore;

const LISTENER_TOKEN: mio::Token = mio::Token(usize::max_value() - 1);
const WAKE_TOKEN: mio::Token = mio::Token(usize::max_value() - 2);
const CONNECTOR_BASE: usize = usize::max_value() / 2;

/// Upper bound on one readiness wait. Keeps mutation-to-wire latency and
/// shutdown latency bounded without busy-looping.
const TICK: Duration = Duration::from_millis(50);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(250);

/// The replication reactor: one single-threaded non-blocking loop owning
/// the listener, the outbound connectors and every established session.
/// Never blocks outside the readiness wait, never holds a map lock while
/// doing I/O.
pub struct Endpoint {
    map: MapStore,
    packet_size: usize,
    heartbeat: Option<Duration>,

    poll: mio::Poll,
    events: mio::Events,

    /// Paired with the `SetReadiness` held by the `Replicator`; must stay
    /// alive for the wakeup to fire.
    _wake: mio::Registration,

    listener: Option<TcpListener>,
    connectors: Vec<Connector>,

    channels: Vec<Channel>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,

    /// Remote identifier → owning channel, for self-collision checks.
    peers: HashMap<PeerId, ChannelId>,

    /// Scratch for the per-tick event list.
    ready: Vec<(mio::Token, mio::Ready)>,

    log: logging::Logger,
}

/// An outbound link that is not (currently) a session: address, in-flight
/// connection attempt, and the backoff schedule for retries.
struct Connector {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    attempt_at: Instant,
    delay: Duration,
}

impl Connector {
    /// Schedules the next attempt and doubles the (capped) backoff.
    fn back_off(&mut self, now: Instant) {
        self.attempt_at = now + self.delay;
        self.delay = std::cmp::min(self.delay * 2, CONNECT_BACKOFF_CAP);
    }
}

impl Endpoint {
    /// Builds the reactor: binds the listener (when configured), arms one
    /// connector per configured peer address, and registers the wakeup
    /// handle. Returns the endpoint and the readiness setter used to
    /// interrupt its wait.
    pub fn new(
        map: MapStore,
        options: &Options,
        log: &logging::Logger,
    ) -> NetworkResult<(Endpoint, mio::SetReadiness)> {
        let poll = mio::Poll::new()?;

        let (wake, wake_readiness) = mio::Registration::new2();
        poll.register(&wake, WAKE_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        let listener = match options.listen {
            Some(addr) => {
                let listener = TcpListener::bind(&addr)?;
                poll.register(
                    &listener,
                    LISTENER_TOKEN,
                    mio::Ready::readable(),
                    mio::PollOpt::edge(),
                )?;
                Some(listener)
            }
            None => None,
        };

        let now = Instant::now();
        let connectors = options
            .peers
            .iter()
            .map(|&addr| Connector {
                addr,
                stream: None,
                attempt_at: now,
                delay: CONNECT_BACKOFF_INITIAL,
            })
            .collect();

        let endpoint = Endpoint {
            map,
            packet_size: options.packet_size,
            heartbeat: options.heartbeat,
            poll,
            events: mio::Events::with_capacity(1024),
            _wake: wake,
            listener,
            connectors,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            peers: HashMap::new(),
            ready: Vec::new(),
            log: log.new(logging::o!()),
        };

        Ok((endpoint, wake_readiness))
    }

    /// The bound listen address, once a listener exists. Lets callers bind
    /// port 0 and discover the assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    /// One reactor iteration: retry due connectors, pump every live
    /// session, wait for readiness (bounded), dispatch it, sweep timeouts.
    pub fn sync(&mut self, now: Instant) {
        self.connect_pending(now);
        self.pump_live(now);

        let timeout = match self.heartbeat {
            Some(interval) if interval < TICK => interval,
            _ => TICK,
        };

        self.poll
            .poll(&mut self.events, Some(timeout))
            .expect("Readiness wait failed");

        self.ready.clear();
        for event in &self.events {
            self.ready.push((event.token(), event.readiness()));
        }

        let ready = std::mem::replace(&mut self.ready, Vec::new());

        for &(token, readiness) in &ready {
            if token == LISTENER_TOKEN {
                self.accept(now);
            } else if token == WAKE_TOKEN {
                // Nothing to do; the wait was interrupted so the run loop
                // can observe its shutdown flag.
            } else if token.0 >= CONNECTOR_BASE {
                self.finish_connect(token.0 - CONNECTOR_BASE, now);
            } else {
                self.channel_ready(token.0, readiness, now);
            }
        }

        self.ready = ready;

        self.housekeeping(now);
    }

    /// Orderly shutdown: flush what the sockets will take, half-close the
    /// write side, briefly drain inbound data, then hard-close everything.
    pub fn shutdown(&mut self, now: Instant) {
        logging::info!(self.log, "shutting down"; "context" => "shutdown", "sessions" => self.live.len());

        drop(self.listener.take());

        let ids: Vec<ChannelId> = self.live.iter().cloned().collect();
        for id in ids {
            drop(self.channels[id].pump(now));
            self.channels[id].shutdown_write();
        }

        let deadline = now + SHUTDOWN_DRAIN;

        while !self.live.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            self.poll
                .poll(&mut self.events, Some(deadline - now))
                .expect("Readiness wait failed");

            self.ready.clear();
            for event in &self.events {
                self.ready.push((event.token(), event.readiness()));
            }

            let ready = std::mem::replace(&mut self.ready, Vec::new());

            for &(token, readiness) in &ready {
                if token.0 < CONNECTOR_BASE && readiness.is_readable() {
                    let id = token.0;
                    if self.live.contains(&id)
                        && self.channels[id].receive(now, &self.map).has_failed()
                    {
                        self.close_channel(id, now);
                    }
                }
            }

            self.ready = ready;
        }

        let ids: Vec<ChannelId> = self.live.iter().cloned().collect();
        for id in ids {
            self.close_channel(id, now);
        }
    }

    /// Starts connection attempts that are due.
    fn connect_pending(&mut self, now: Instant) {
        for index in 0..self.connectors.len() {
            if self.connectors[index].stream.is_some() || now < self.connectors[index].attempt_at {
                continue;
            }

            let addr = self.connectors[index].addr;

            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    self.poll
                        .register(
                            &stream,
                            mio::Token(CONNECTOR_BASE + index),
                            mio::Ready::writable(),
                            mio::PollOpt::edge(),
                        )
                        .expect("Connector registration failed");

                    self.connectors[index].stream = Some(stream);

                    logging::trace!(self.log, "connection attempt started";
                                    "context" => "connect", "peer_addr" => %addr);
                }
                Err(err) => {
                    logging::debug!(self.log, "connection attempt failed";
                                    "context" => "connect", "peer_addr" => %addr, "error" => %err);
                    self.connectors[index].back_off(now);
                }
            }
        }
    }

    /// Writable readiness on a connector token: the attempt finished, one
    /// way or the other.
    fn finish_connect(&mut self, index: usize, now: Instant) {
        if index >= self.connectors.len() {
            return;
        }

        let stream = match self.connectors[index].stream.take() {
            Some(stream) => stream,
            None => return,
        };

        drop(self.poll.deregister(&stream));

        let failed = match stream.take_error() {
            Ok(None) => stream.peer_addr().is_err(),
            _ => true,
        };

        if failed {
            let addr = self.connectors[index].addr;
            logging::debug!(self.log, "connection refused";
                            "context" => "connect",
                            "peer_addr" => %addr,
                            "error" => ?ErrorType::ConnectFailed);
            self.connectors[index].back_off(now);
            return;
        }

        self.connectors[index].delay = CONNECT_BACKOFF_INITIAL;

        let addr = self.connectors[index].addr;
        logging::debug!(self.log, "connection established";
                        "context" => "connect", "peer_addr" => %addr);

        self.install(stream, Some(index), now);
    }

    /// Accepts every pending inbound connection.
    fn accept(&mut self, now: Instant) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    logging::debug!(self.log, "peer connected";
                                    "context" => "accept", "peer_addr" => %addr);
                    self.install(stream, None, now);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::error!(self.log, "accept failed";
                                    "context" => "accept", "error" => %err);
                    return;
                }
            }
        }
    }

    /// Wraps a fresh stream in a channel slot and registers it.
    fn install(&mut self, stream: TcpStream, connector: Option<usize>, now: Instant) {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = self.channels.len();
                self.channels
                    .push(Channel::new(self.map.entry_max_size(), self.packet_size, Some(&self.log)));
                id
            }
        };

        self.channels[id].open(id, stream, connector, &self.map, now);
        self.channels[id]
            .register(id, &self.poll)
            .expect("Channel registration failed");
        self.live.insert(id);
    }

    /// Dispatches readiness on an established session.
    fn channel_ready(&mut self, id: ChannelId, readiness: mio::Ready, now: Instant) {
        if !self.live.contains(&id) {
            return;
        }

        if readiness.is_readable() {
            loop {
                match self.channels[id].receive(now, &self.map) {
                    // Welcome parsed: vet it, then keep reading whatever
                    // arrived behind it.
                    Ok(Some(remote)) => {
                        self.complete_handshake(id, remote);

                        if !self.live.contains(&id) {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        logging::debug!(self.log, "session lost";
                                        "context" => "receive", "channel_id" => id, "error" => ?err);
                        self.close_channel(id, now);
                        return;
                    }
                }
            }
        }

        if readiness.is_writable() && self.live.contains(&id) && self.channels[id].pump(now).has_failed() {
            self.close_channel(id, now);
        }
    }

    /// The remote announced its identifier: reject a session we already
    /// hold (or our own identifier), otherwise bind the modification
    /// iterator and start replicating.
    fn complete_handshake(&mut self, id: ChannelId, remote: PeerId) {
        if remote == self.map.identifier() || self.peers.contains_key(&remote) {
            logging::warn!(self.log, "rejecting duplicate peer session";
                           "context" => "handshake", "channel_id" => id, "remote" => remote);
            self.close_channel(id, Instant::now());
            return;
        }

        let iter = self.map.modification_iterator(remote);

        match self.channels[id].replicate_from(iter, &self.map) {
            Ok(()) => {
                self.peers.insert(remote, id);
                logging::info!(self.log, "peer session established";
                               "context" => "handshake", "channel_id" => id, "remote" => remote);
            }
            Err(err) => {
                logging::debug!(self.log, "session lost during bootstrap";
                                "context" => "handshake", "channel_id" => id, "error" => ?err);
                self.close_channel(id, Instant::now());
            }
        }
    }

    /// Flush-and-refill on every live session. Runs each tick so locally
    /// queued mutations reach the wire without waiting for a readiness
    /// edge.
    fn pump_live(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.live.iter().cloned().collect();

        for id in ids {
            if self.channels[id].pump(now).has_failed() {
                logging::debug!(self.log, "session lost";
                                "context" => "send", "channel_id" => id);
                self.close_channel(id, now);
            }
        }
    }

    /// Timeout sweep: stalled handshakes, silent peers (2x heartbeat), and
    /// heartbeat emission on quiet sessions.
    fn housekeeping(&mut self, now: Instant) {
        let ids: Vec<ChannelId> = self.live.iter().cloned().collect();

        for id in ids {
            let retain = match self.channels[id].state() {
                ChannelState::Handshake(since) => now.duration_since(since) < HANDSHAKE_TIMEOUT,
                ChannelState::Replicating(_) => match self.heartbeat {
                    Some(interval) => {
                        if self.channels[id].last_ingress_elapsed(now) >= interval * 2 {
                            false
                        } else {
                            if self.channels[id].last_egress_elapsed(now) >= interval {
                                self.channels[id].heartbeat();
                            }
                            true
                        }
                    }
                    None => true,
                },
                _ => true,
            };

            if !retain {
                logging::debug!(self.log, "session timed out";
                                "context" => "housekeeping", "channel_id" => id);
                self.close_channel(id, now);
            }
        }
    }

    /// Tears down one session: registry, poll registration, socket. A
    /// connector-born session schedules its connector for a retry.
    fn close_channel(&mut self, id: ChannelId, now: Instant) {
        if let Some(remote) = self.channels[id].remote_identifier() {
            // Only release the identifier if this session owns it; a
            // collision-rejected duplicate must not evict the survivor.
            if self.peers.get(&remote) == Some(&id) {
                self.peers.remove(&remote);
            }
        }

        if let Some(index) = self.channels[id].connector_index() {
            self.connectors[index].back_off(now);
        }

        self.channels[id].deregister(&self.poll);
        self.channels[id].close();
        self.live.remove(&id);
        self.free.push(id);
    }
}
