// src/lib.rs

//! ferry: a point-to-point payload transport runtime.
//!
//! ferry moves opaque byte buffers between two processes, local or
//! remote, over the cheapest mechanism available. Two layers compose:
//!
//! * a **transport** provides a reliable, ordered, message-framed byte
//!   pipe, either over TCP sockets ([`transport::sock`]) or over
//!   shared-memory rings with eventfd wakeups ([`transport::shm`]);
//! * a **channel** performs the actual payload transfer, multiplexed
//!   over a transport control connection and possibly using a
//!   different medium entirely, e.g. a cross-memory-attach read
//!   between processes on the same host ([`channel::cma`]).
//!
//! A [`context::Context`] owns the registered transports and channel
//! factories and is the root of the close cascade: closing it closes
//! every subordinate connection, listener and channel exactly once.
//!
//! Everything is callback-driven. Each object is bound to one
//! serializing loop (its transport's event engine, or an on-demand
//! serializer); user-facing methods submit work and return, and every
//! completion callback fires exactly once, with the object's first
//! latched error after a failure or close.

pub mod callback;
pub mod channel;
pub mod closing;
pub mod codec;
pub mod context;
pub mod doorbell;
pub mod error;
pub mod fdpass;
pub mod ring;
pub mod shm;
pub mod transport;

pub use error::{Error, Result};
