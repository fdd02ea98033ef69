// src/transport/shm/context.rs

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::closing::{Closable, ClosingEmitter};
use crate::error::{Error, Result};
use crate::ring::DEFAULT_RING_CAPACITY;
use crate::transport::shm::connection::ShmConnection;
use crate::transport::shm::listener::ShmListener;
use crate::transport::shm::looper::ShmLoop;
use crate::transport::shm::reactor::Reactor;
use crate::transport::{Connection, Listener, Transport};

static ADDR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-unique Unix-socket path for the ring handshake.
pub fn unique_addr() -> String {
    let seq = ADDR_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir()
        .join(format!("ferry-shm-{}-{}", std::process::id(), seq))
        .to_string_lossy()
        .into_owned()
}

/// Tunables for the shared-memory transport.
#[derive(Debug, Clone)]
pub struct ShmOptions {
    /// Per-direction ring capacity in bytes; must be a power of two.
    pub ring_capacity: usize,
}

impl Default for ShmOptions {
    fn default() -> Self {
        ShmOptions {
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}

/// The shared-memory transport flavor: ring-pair connections
/// coordinated by an epoll loop and its reactor. Addresses are Unix
/// socket paths, only meaningful on the same host.
pub struct ShmTransport {
    looper: Arc<ShmLoop>,
    emitter: Arc<ClosingEmitter>,
    options: ShmOptions,
    closed: AtomicBool,
    joined: AtomicBool,
}

impl ShmTransport {
    pub fn new() -> Result<Arc<Self>> {
        Self::with_options(ShmOptions::default())
    }

    pub fn with_options(options: ShmOptions) -> Result<Arc<Self>> {
        if !options.ring_capacity.is_power_of_two() {
            return Err(Error::ProtocolViolation(format!(
                "ring capacity {} is not a power of two",
                options.ring_capacity
            )));
        }
        let reactor = Reactor::start().map_err(Error::from)?;
        let looper = ShmLoop::start(reactor).map_err(Error::from)?;
        Ok(Arc::new(ShmTransport {
            looper,
            emitter: Arc::new(ClosingEmitter::new()),
            options,
            closed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        }))
    }
}

impl Transport for ShmTransport {
    fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>> {
        let socket = UnixStream::connect(addr).map_err(|_| Error::system("connect"))?;
        let connection = ShmConnection::new(
            Arc::clone(&self.looper),
            socket,
            self.options.ring_capacity,
        );
        connection.attach_closer(Arc::clone(&self.emitter));
        Ok(connection)
    }

    fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>> {
        let listener = ShmListener::bind(
            Arc::clone(&self.looper),
            addr,
            self.options.ring_capacity,
            Arc::clone(&self.emitter),
        )?;
        Ok(listener)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("shm transport closing");
            self.emitter.close();
            self.looper.close();
        }
    }

    fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::SeqCst) {
            self.looper.join();
        }
    }
}

impl Closable for ShmConnection {
    fn close(&self) {
        Connection::close(self);
    }
}

impl Closable for ShmListener {
    fn close(&self) {
        Listener::close(self);
    }
}
