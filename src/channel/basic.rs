// src/channel/basic.rs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::callback::{eager, lazy, CallbackSubject, TaskSerializer};
use crate::channel::{
    Channel, ChannelFactory, DescriptorCallback, Endpoint, RecvCallback, SendCallback,
};
use crate::closing::{Closable, ClosingEmitter, ClosingReceiver};
use crate::codec;
use crate::error::{Error, Result};
use crate::transport::Connection;

/// Control packets exchanged on the connection. Both endpoints are
/// symmetric: a `Request` asks the sender to start pushing the payload
/// for an operation, a `Reply` announces that the payload bytes follow
/// immediately on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Packet {
    Request { operation_id: u64 },
    Reply { operation_id: u64 },
}

/// The out-of-band descriptor emitted by `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Descriptor {
    operation_id: u64,
}

struct SendOperation {
    id: u64,
    data: Bytes,
    callback: SendCallback,
}

struct RecvOperation {
    id: u64,
    buffer: Option<BytesMut>,
    callback: RecvCallback,
}

struct ChannelState {
    error: Option<Error>,
    next_operation_id: u64,
    send_ops: VecDeque<SendOperation>,
    recv_ops: VecDeque<RecvOperation>,
    closer: Option<ClosingReceiver>,
}

/// The simplest channel: payload bytes travel on the control
/// connection itself, coordinated by request/reply packets matched on
/// operation ids.
pub struct BasicChannel {
    connection: Arc<dyn Connection>,
    serializer: TaskSerializer,
    weak_self: Weak<BasicChannel>,
    state: Mutex<ChannelState>,
}

impl BasicChannel {
    fn new(connection: Arc<dyn Connection>, emitter: Arc<ClosingEmitter>) -> Arc<Self> {
        let channel = Arc::new_cyclic(|weak| BasicChannel {
            connection,
            serializer: TaskSerializer::new(),
            weak_self: weak.clone(),
            state: Mutex::new(ChannelState {
                error: None,
                next_operation_id: 0,
                send_ops: VecDeque::new(),
                recv_ops: VecDeque::new(),
                closer: None,
            }),
        });

        let init = Arc::clone(&channel);
        channel.serializer.defer(Box::new(move || {
            let mut receiver = ClosingReceiver::new(emitter);
            receiver.activate(&init);
            init.state.lock().closer = Some(receiver);
            init.arm_packet_read();
        }));
        channel
    }

    /// Arm the connection to deliver the next protocol packet. Packet
    /// reads are infrastructure: their failures collapse the channel
    /// without reaching user callbacks.
    fn arm_packet_read(self: &Arc<Self>) {
        codec::read_framed::<Packet, _>(
            &self.connection,
            lazy(self, |channel, packet| channel.on_packet(packet)),
        );
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        debug_assert!(self.serializer.in_loop());
        match packet {
            Packet::Request { operation_id } => self.on_request(operation_id),
            Packet::Reply { operation_id } => self.on_reply(operation_id),
        }
        // Wait for the next packet. Queued after any payload I/O the
        // handlers above submitted, which keeps stream order intact.
        self.arm_packet_read();
    }

    /// The peer is ready: announce the payload with a reply, then
    /// stream the bytes.
    fn on_request(self: &Arc<Self>, operation_id: u64) {
        let data = {
            let st = self.state.lock();
            st.send_ops
                .iter()
                .find(|op| op.id == operation_id)
                .map(|op| op.data.clone())
        };
        let Some(data) = data else {
            self.latch(Error::ProtocolViolation(format!(
                "request for unknown send operation {operation_id}"
            )));
            return;
        };

        codec::write_framed(
            &self.connection,
            &Packet::Reply { operation_id },
            Box::new(lazy(self, |_channel, ()| {})),
        );
        self.connection.write(
            data,
            Box::new(eager(self, move |channel, _done: Option<()>| {
                channel.send_completed(operation_id);
            })),
        );
    }

    /// The payload follows on the stream: read it into the buffer the
    /// recv operation parked.
    fn on_reply(self: &Arc<Self>, operation_id: u64) {
        let buffer = {
            let mut st = self.state.lock();
            st.recv_ops
                .iter_mut()
                .find(|op| op.id == operation_id)
                .and_then(|op| op.buffer.take())
        };
        let Some(buffer) = buffer else {
            self.latch(Error::ProtocolViolation(format!(
                "reply for unknown recv operation {operation_id}"
            )));
            return;
        };

        self.connection.read_into(
            buffer,
            Box::new(eager(self, move |channel, buffer: Option<BytesMut>| {
                channel.recv_completed(operation_id, buffer);
            })),
        );
    }

    fn send_completed(&self, operation_id: u64) {
        debug_assert!(self.serializer.in_loop());
        let (op, error) = {
            let mut st = self.state.lock();
            let op = remove_by_id(&mut st.send_ops, operation_id, |op| op.id);
            (op, st.error.clone())
        };
        // The op may already have been drained by the error teardown;
        // its callback fired there.
        if let Some(op) = op {
            (op.callback)(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    fn recv_completed(&self, operation_id: u64, buffer: Option<BytesMut>) {
        debug_assert!(self.serializer.in_loop());
        let (op, error) = {
            let mut st = self.state.lock();
            let op = remove_by_id(&mut st.recv_ops, operation_id, |op| op.id);
            (op, st.error.clone())
        };
        if let Some(op) = op {
            (op.callback)(match (error, buffer) {
                (None, Some(buffer)) => Ok(buffer),
                (Some(error), _) => Err(error),
                (None, None) => Err(Error::ChannelClosed),
            });
        }
    }

    /// Close the control connection, which flushes the in-flight
    /// transport callbacks, then drain every remaining operation with
    /// the latched error.
    fn handle_error(&self) {
        debug_assert!(self.serializer.in_loop());
        self.connection.close();

        let (sends, recvs, error) = {
            let mut st = self.state.lock();
            let error = st.error.clone().unwrap_or(Error::ChannelClosed);
            (
                std::mem::take(&mut st.send_ops),
                std::mem::take(&mut st.recv_ops),
                error,
            )
        };
        tracing::debug!(error = %error, "basic channel entering error state");
        for op in sends {
            (op.callback)(Err(error.clone()));
        }
        for op in recvs {
            (op.callback)(Err(error.clone()));
        }
    }
}

fn remove_by_id<T>(queue: &mut VecDeque<T>, id: u64, key: impl Fn(&T) -> u64) -> Option<T> {
    let index = queue.iter().position(|op| key(op) == id)?;
    queue.remove(index)
}

impl CallbackSubject for BasicChannel {
    fn defer(&self, task: Box<dyn FnOnce() + Send>) {
        self.serializer.defer(task);
    }

    fn latched_error(&self) -> Option<Error> {
        self.state.lock().error.clone()
    }

    fn latch(&self, error: Error) {
        {
            let mut st = self.state.lock();
            if st.error.is_some() {
                return;
            }
            st.error = Some(error);
        }
        self.handle_error();
    }
}

impl Channel for BasicChannel {
    fn send(&self, data: Bytes, descriptor: DescriptorCallback, callback: SendCallback) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.serializer.defer(Box::new(move || {
            let result = {
                let mut st = this.state.lock();
                if let Some(error) = st.error.clone() {
                    Err((error, callback))
                } else {
                    let id = st.next_operation_id;
                    st.next_operation_id += 1;
                    st.send_ops.push_back(SendOperation { id, data, callback });
                    Ok(id)
                }
            };
            match result {
                Ok(id) => {
                    // The descriptor is produced synchronously; it only
                    // needs to carry the operation id.
                    descriptor(codec::encode(&Descriptor { operation_id: id }));
                }
                Err((error, callback)) => {
                    descriptor(Err(error.clone()));
                    callback(Err(error));
                }
            }
        }));
    }

    fn recv(&self, descriptor: Bytes, buffer: BytesMut, callback: RecvCallback) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.serializer.defer(Box::new(move || {
            let parsed: Result<Descriptor> = codec::decode(&descriptor);
            let operation_id = match parsed {
                Ok(descriptor) => descriptor.operation_id,
                Err(error) => {
                    callback(Err(error));
                    return;
                }
            };

            {
                let mut st = this.state.lock();
                if let Some(error) = st.error.clone() {
                    drop(st);
                    callback(Err(error));
                    return;
                }
                st.recv_ops.push_back(RecvOperation {
                    id: operation_id,
                    buffer: Some(buffer),
                    callback,
                });
            }

            // Ask the peer to start pushing now that a destination
            // exists.
            codec::write_framed(
                &this.connection,
                &Packet::Request { operation_id },
                Box::new(lazy(&this, |_channel, ()| {})),
            );
        }));
    }

    fn close(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.serializer.defer(Box::new(move || {
            if this.state.lock().error.is_none() {
                this.latch(Error::ChannelClosed);
            }
        }));
    }
}

impl Closable for BasicChannel {
    fn close(&self) {
        Channel::close(self);
    }
}

/// Factory for [`BasicChannel`]s. Works between any pair of hosts, so
/// its domain descriptor is a universal constant.
pub struct BasicChannelFactory {
    descriptor: String,
    emitter: Arc<ClosingEmitter>,
    closed: AtomicBool,
}

impl BasicChannelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(BasicChannelFactory {
            descriptor: "basic:any".to_string(),
            emitter: Arc::new(ClosingEmitter::new()),
            closed: AtomicBool::new(false),
        })
    }
}

impl ChannelFactory for BasicChannelFactory {
    fn domain_descriptor(&self) -> &str {
        &self.descriptor
    }

    fn create_channel(
        &self,
        connection: Arc<dyn Connection>,
        _endpoint: Endpoint,
    ) -> Arc<dyn Channel> {
        BasicChannel::new(connection, Arc::clone(&self.emitter))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("basic channel factory closing");
            self.emitter.close();
        }
    }

    fn join(&self) {
        self.close();
    }
}
