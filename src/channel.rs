// src/channel.rs

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::transport::Connection;

pub mod basic;
pub mod cma;

/// Which side of the control connection this endpoint came from. Only
/// channels that need symmetry-breaking look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Listen,
    Connect,
}

/// Carries the channel-specific metadata from `send` to the matching
/// `recv` on the peer; opaque to everything in between.
pub type DescriptorCallback = Box<dyn FnOnce(Result<Bytes>) + Send>;
/// Fires once the payload has been handed off to the peer.
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;
/// Fires once the payload has landed in the caller's buffer.
pub type RecvCallback = Box<dyn FnOnce(Result<BytesMut>) + Send>;

/// A payload mover multiplexed over a control connection.
///
/// `send` synchronously produces a descriptor that must travel
/// out-of-band to the peer, which feeds it to `recv` together with a
/// destination buffer of exactly the payload's length. No ordering is
/// guaranteed between distinct operations; each callback fires exactly
/// once, with the channel's latched error after a failure or close.
pub trait Channel: Send + Sync {
    fn send(&self, data: Bytes, descriptor: DescriptorCallback, callback: SendCallback);

    fn recv(&self, descriptor: Bytes, buffer: BytesMut, callback: RecvCallback);

    fn close(&self);
}

/// A factory for one kind of channel.
pub trait ChannelFactory: Send + Sync {
    /// Two endpoints may pair their channels only if their domain
    /// descriptors compare equal.
    fn domain_descriptor(&self) -> &str;

    /// Build a channel over an established control connection.
    fn create_channel(&self, connection: Arc<dyn Connection>, endpoint: Endpoint)
        -> Arc<dyn Channel>;

    /// Close every channel created by this factory.
    fn close(&self);

    /// Close, then wait for any worker threads.
    fn join(&self);
}
