//! Ties the reactor (and the optional datagram loop) to threads and gives
//! the application a handle with clean start/close semantics. After
//! `close()` the map remains usable; it just stops replicating.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use ember::logging;

use crate::net::datagram::DatagramLoop;
use crate::net::endpoint::Endpoint;
use crate::net::shared::NetworkResult;
use crate::net::Options;
use crate::store::MapStore;

/// Handle to a running replication engine. Dropping the handle shuts the
/// engine down.
pub struct Replicator {
    running: Arc<AtomicBool>,

    wake: mio::SetReadiness,
    reactor: Option<thread::JoinHandle<()>>,

    datagram_wake: Option<mio::SetReadiness>,
    datagram: Option<thread::JoinHandle<()>>,

    local_addr: Option<SocketAddr>,
    datagram_addr: Option<SocketAddr>,

    log: logging::Logger,
}

impl Replicator {
    /// Builds the endpoint from the supplied options and spawns the
    /// reactor thread (plus the datagram thread when configured).
    pub fn start(map: MapStore, options: Options, log: &logging::Logger) -> NetworkResult<Replicator> {
        let log = log.new(logging::o!("identifier" => map.identifier()));

        // Everything that can fail is built before any thread starts, so a
        // late construction error cannot leak an already-running reactor.
        let (mut endpoint, wake) = Endpoint::new(map.clone(), &options, &log)?;
        let local_addr = endpoint.local_addr();

        let mut datagram_wake = None;
        let mut datagram_addr = None;
        let datagram_loop = match &options.datagram {
            Some(datagram_options) => {
                let (datagram, wake) = DatagramLoop::new(map, datagram_options, &log)?;
                datagram_addr = datagram.local_addr();
                datagram_wake = Some(wake);
                Some(datagram)
            }
            None => None,
        };

        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let reactor = thread::Builder::new()
            .name("meshmap-reactor".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    endpoint.sync(Instant::now());
                }

                endpoint.shutdown(Instant::now());
            })
            .expect("Failed spawning reactor thread");

        let datagram = datagram_loop.map(|mut datagram| {
            let flag = running.clone();

            thread::Builder::new()
                .name("meshmap-datagram".into())
                .spawn(move || datagram.run(&flag))
                .expect("Failed spawning datagram thread")
        });

        logging::info!(log, "replication started";
                       "context" => "start",
                       "listen" => ?local_addr,
                       "peers" => options.peers.len());

        Ok(Replicator {
            running,
            wake,
            reactor: Some(reactor),
            datagram_wake,
            datagram,
            local_addr,
            datagram_addr,
            log,
        })
    }

    /// Address the listener bound to, if one was configured. Binding port
    /// 0 and reading this back yields an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Address the datagram socket bound to, if configured.
    pub fn datagram_addr(&self) -> Option<SocketAddr> {
        self.datagram_addr
    }

    /// Stops replication: interrupts the reactor's wait, closes the
    /// listener and every session (half-close, brief drain, hard close)
    /// and joins the threads. Idempotent.
    pub fn close(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        drop(self.wake.set_readiness(mio::Ready::readable()));

        if let Some(wake) = &self.datagram_wake {
            drop(wake.set_readiness(mio::Ready::readable()));
        }

        if let Some(handle) = self.reactor.take() {
            drop(handle.join());
        }

        if let Some(handle) = self.datagram.take() {
            drop(handle.join());
        }

        logging::info!(self.log, "replication stopped"; "context" => "close");
    }

    /// Blocks until the reactor thread exits. Used by daemon processes
    /// that have nothing else to do on the main thread.
    pub fn wait(&mut self) {
        if let Some(handle) = self.reactor.take() {
            drop(handle.join());
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.close();
    }
}
