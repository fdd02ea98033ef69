// src/transport/sock/context.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::closing::{Closable, ClosingEmitter};
use crate::error::Result;
use crate::transport::sock::connection::SockConnection;
use crate::transport::sock::listener::SockListener;
use crate::transport::sock::looper::SockLoop;
use crate::transport::{Connection, Listener, Transport};

/// The socket transport flavor: TCP connections driven by one poll
/// loop. Addresses are `host:port` strings.
pub struct SockTransport {
    looper: Arc<SockLoop>,
    emitter: Arc<ClosingEmitter>,
    closed: AtomicBool,
    joined: AtomicBool,
}

impl SockTransport {
    pub fn new() -> Result<Arc<Self>> {
        let looper = SockLoop::start().map_err(crate::error::Error::from)?;
        Ok(Arc::new(SockTransport {
            looper,
            emitter: Arc::new(ClosingEmitter::new()),
            closed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        }))
    }
}

impl Transport for SockTransport {
    fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>> {
        let connection = SockConnection::connect(Arc::clone(&self.looper), addr)?;
        connection.attach_closer(Arc::clone(&self.emitter));
        Ok(connection)
    }

    fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>> {
        let listener = SockListener::bind(
            Arc::clone(&self.looper),
            addr,
            Arc::clone(&self.emitter),
        )?;
        Ok(listener)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("sock transport closing");
            self.emitter.close();
        }
    }

    fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::SeqCst) {
            self.looper.join();
        }
    }
}

impl Closable for SockConnection {
    fn close(&self) {
        Connection::close(self);
    }
}

impl Closable for SockListener {
    fn close(&self) {
        Listener::close(self);
    }
}
