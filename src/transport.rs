// src/transport.rs

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::Result;

pub mod shm;
pub mod sock;

/// Completion for an implicit-allocation read: the full frame payload.
pub type ReadCallback = Box<dyn FnOnce(Result<Bytes>) + Send>;
/// Completion for an explicit-destination read: the caller's buffer,
/// filled.
pub type ReadIntoCallback = Box<dyn FnOnce(Result<BytesMut>) + Send>;
/// Completion for a write.
pub type WriteCallback = Box<dyn FnOnce(Result<()>) + Send>;
/// Completion for an accept.
pub type AcceptCallback = Box<dyn FnOnce(Result<Arc<dyn Connection>>) + Send>;

/// A reliable, ordered, message-framed byte pipe between two endpoints.
///
/// Every method submits work and returns; completions fire on the
/// transport's loop thread. Writes complete in submission order, reads
/// complete in submission order, and each submitted callback fires
/// exactly once. Once the connection latches an error, every queued and
/// future submission fires with that error.
pub trait Connection: Send + Sync {
    /// Read one message into a freshly allocated buffer.
    fn read(&self, callback: ReadCallback);

    /// Read one message into `buffer`, whose length must equal the
    /// inbound frame length.
    fn read_into(&self, buffer: BytesMut, callback: ReadIntoCallback);

    /// Write one message.
    fn write(&self, data: Bytes, callback: WriteCallback);

    /// Shut down; queued and in-flight operations abort with
    /// `ConnectionClosed`.
    fn close(&self);
}

/// An accepting endpoint producing connections.
pub trait Listener: Send + Sync {
    /// Queue an accept callback; callbacks pair with incoming
    /// connections first-in first-out.
    fn accept(&self, callback: AcceptCallback);

    /// The address the listener is bound to.
    fn addr(&self) -> String;

    fn close(&self);
}

/// A transport flavor: a factory of connections and listeners sharing
/// one event engine.
pub trait Transport: Send + Sync {
    fn connect(&self, addr: &str) -> Result<Arc<dyn Connection>>;

    fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>>;

    /// Close the engine and all of its connections and listeners.
    fn close(&self);

    /// Close, then wait for the engine thread(s) to exit.
    fn join(&self);
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Still handshaking; operations queue up.
    Initializing,
    /// Fully established.
    Ready,
    /// Error latched, teardown in progress.
    Closing,
    /// Torn down; everything fails fast.
    Closed,
}

bitflags::bitflags! {
    /// Readiness reported to an event handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Ready: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const ERROR    = 0b0100;
        const HUP      = 0b1000;
    }
}

/// An object driven by an event engine. Handlers are held weakly by the
/// engine and upgraded only for the duration of one dispatch.
pub(crate) trait EventHandler: Send + Sync {
    /// Called on the loop thread when `fd` becomes ready.
    fn handle_events(&self, fd: std::os::fd::RawFd, ready: Ready);

    /// Called on the loop thread when the engine shuts down with this
    /// handler still registered.
    fn handle_close(&self);
}
