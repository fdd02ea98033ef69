// src/transport/shm/connection.rs

use std::collections::VecDeque;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::closing::{ClosingEmitter, ClosingReceiver};
use crate::error::{Error, Result};
use crate::fdpass;
use crate::ring::Ring;
use crate::transport::{
    Connection, ConnectionState, EventHandler, Ready, ReadCallback, ReadIntoCallback,
    WriteCallback,
};

const FRAME_HEADER_LEN: usize = 8;

/// A message-framed connection over a pair of shared-memory rings.
///
/// Each side creates its own inbox ring and hands the segment fd plus
/// the two doorbell fds to the peer over the Unix socket; the peer's
/// inbox becomes our outbox. Messages larger than the ring are
/// transparently chunked: the writer publishes what fits and resumes
/// on the space doorbell, the reader accumulates until the full frame
/// has arrived, so one completion always delivers the whole message.
/// The Unix socket stays registered for the lifetime of the connection
/// to observe peer shutdown as an end-of-stream.
pub(crate) struct ShmConnection {
    looper: Arc<crate::transport::shm::looper::ShmLoop>,
    weak_self: Weak<ShmConnection>,
    state: Mutex<ShmConnState>,
}

struct ShmConnState {
    socket: Option<UnixStream>,
    phase: ConnectionState,
    error: Option<Error>,
    ring_capacity: usize,
    /// The ring we consume; created locally.
    inbox: Option<Ring>,
    /// The ring we produce into; mapped from the peer's fds.
    outbox: Option<Ring>,
    inbox_registered: bool,
    outbox_space_registered: bool,
    write_ops: VecDeque<WriteOp>,
    read_ops: VecDeque<ReadOp>,
    assembly: FrameAssembly,
    closer: Option<ClosingReceiver>,
}

struct WriteOp {
    header: [u8; FRAME_HEADER_LEN],
    header_pos: usize,
    data: Bytes,
    data_pos: usize,
    callback: WriteCallback,
}

enum ReadDest {
    Alloc(ReadCallback),
    Into(Option<BytesMut>, ReadIntoCallback),
}

struct ReadOp {
    dest: ReadDest,
}

#[derive(Default)]
struct FrameAssembly {
    header: [u8; FRAME_HEADER_LEN],
    header_fill: usize,
    payload: Option<BytesMut>,
    payload_fill: usize,
}

impl FrameAssembly {
    fn reset(&mut self) {
        self.header_fill = 0;
        self.payload = None;
        self.payload_fill = 0;
    }
}

enum Done {
    Write(WriteCallback, Result<()>),
    ReadAlloc(ReadCallback, Result<Bytes>),
    ReadInto(ReadIntoCallback, Result<BytesMut>),
}

impl Done {
    fn fire(self) {
        match self {
            Done::Write(cb, r) => cb(r),
            Done::ReadAlloc(cb, r) => cb(r),
            Done::ReadInto(cb, r) => cb(r),
        }
    }
}

impl ShmConnection {
    pub(crate) fn new(
        looper: Arc<crate::transport::shm::looper::ShmLoop>,
        socket: UnixStream,
        ring_capacity: usize,
    ) -> Arc<Self> {
        let connection = Arc::new_cyclic(|weak| ShmConnection {
            looper: Arc::clone(&looper),
            weak_self: weak.clone(),
            state: Mutex::new(ShmConnState {
                socket: Some(socket),
                phase: ConnectionState::Initializing,
                error: None,
                ring_capacity,
                inbox: None,
                outbox: None,
                inbox_registered: false,
                outbox_space_registered: false,
                write_ops: VecDeque::new(),
                read_ops: VecDeque::new(),
                assembly: FrameAssembly::default(),
                closer: None,
            }),
        });

        let init = Arc::clone(&connection);
        looper.defer_to_loop(Box::new(move || init.init_from_loop()));
        connection
    }

    pub(crate) fn attach_closer(self: &Arc<Self>, emitter: Arc<ClosingEmitter>) {
        let mut receiver = ClosingReceiver::new(emitter);
        receiver.activate(self);
        self.state.lock().closer = Some(receiver);
    }

    fn defer<F>(&self, f: F)
    where
        F: FnOnce(&Arc<Self>) + Send + 'static,
    {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.looper.defer_to_loop(Box::new(move || f(&this)));
    }

    fn as_handler(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        Arc::clone(self) as Arc<dyn EventHandler>
    }

    /// Create the inbox, send its fds to the peer, and start watching
    /// the socket for the peer's fds.
    fn init_from_loop(self: &Arc<Self>) {
        debug_assert!(self.looper.in_loop());
        let mut dones = Vec::new();
        {
            let mut st = self.state.lock();
            if st.error.is_some() {
                return;
            }

            let outcome = (|| -> Result<()> {
                let inbox = Ring::create(st.ring_capacity).map_err(|_| Error::system("memfd"))?;
                let (seg_fd, data_fd, space_fd) = inbox
                    .export_fds()
                    .map_err(|_| Error::system("dup"))?;
                let socket = st.socket.as_ref().ok_or(Error::ConnectionClosed)?;
                socket
                    .set_nonblocking(true)
                    .map_err(|_| Error::system("fcntl"))?;
                fdpass::send_fds(
                    socket,
                    &[seg_fd.as_raw_fd(), data_fd.as_raw_fd(), space_fd.as_raw_fd()],
                    &(st.ring_capacity as u64).to_le_bytes(),
                )
                .map_err(|_| Error::system("sendmsg"))?;
                st.inbox = Some(inbox);
                Ok(())
            })();

            match outcome {
                Ok(()) => {
                    let socket_fd = st.socket.as_ref().map(|s| s.as_raw_fd());
                    if let Some(fd) = socket_fd {
                        if let Err(e) = self.looper.register_fd(fd, &self.as_handler()) {
                            tracing::warn!(error = %e, "failed to watch handshake socket");
                            self.latch_from_loop(&mut st, Error::system("epoll_ctl"), &mut dones);
                        }
                    }
                }
                Err(error) => self.latch_from_loop(&mut st, error, &mut dones),
            }
        }
        for done in dones {
            done.fire();
        }
    }

    /// The peer's fds arrived: map its inbox as our outbox and start
    /// moving bytes.
    fn complete_handshake_from_loop(
        self: &Arc<Self>,
        st: &mut ShmConnState,
        dones: &mut Vec<Done>,
    ) {
        let outcome = (|| -> Result<bool> {
            let socket = st.socket.as_ref().ok_or(Error::ConnectionClosed)?;
            let (fds, payload) = match fdpass::recv_fds(socket, 3, 8) {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::Eof)
                }
                Err(_) => return Err(Error::system("recvmsg")),
            };
            let capacity = u64::from_le_bytes(
                payload
                    .try_into()
                    .map_err(|_| Error::ProtocolViolation("bad handshake payload".into()))?,
            ) as usize;
            if !capacity.is_power_of_two() {
                return Err(Error::ProtocolViolation(format!(
                    "peer ring capacity {capacity} is not a power of two"
                )));
            }
            let mut fds = fds.into_iter();
            let (seg, data, space) = (
                fds.next().expect("three fds"),
                fds.next().expect("three fds"),
                fds.next().expect("three fds"),
            );
            let outbox =
                Ring::from_parts(seg, data, space, capacity).map_err(|_| Error::system("mmap"))?;
            st.outbox = Some(outbox);
            Ok(true)
        })();

        match outcome {
            Ok(false) => {}
            Ok(true) => {
                st.phase = ConnectionState::Ready;
                tracing::debug!("shm connection established");
                let inbox_fd = st.inbox.as_ref().map(|r| r.data_signal_fd());
                if let Some(fd) = inbox_fd {
                    match self.looper.register_fd(fd, &self.as_handler()) {
                        Ok(()) => st.inbox_registered = true,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to watch inbox doorbell");
                            self.latch_from_loop(st, Error::system("epoll_ctl"), dones);
                            return;
                        }
                    }
                }
                self.process_writes(st, dones);
                self.process_reads(st, dones);
            }
            Err(error) => self.latch_from_loop(st, error, dones),
        }
    }

    fn latch_from_loop(&self, st: &mut ShmConnState, error: Error, dones: &mut Vec<Done>) {
        if st.error.is_some() {
            return;
        }
        tracing::debug!(error = %error, "shm connection latched error");
        st.error = Some(error.clone());
        st.phase = ConnectionState::Closing;

        for op in st.write_ops.drain(..) {
            dones.push(Done::Write(op.callback, Err(error.clone())));
        }
        for op in st.read_ops.drain(..) {
            match op.dest {
                ReadDest::Alloc(cb) => dones.push(Done::ReadAlloc(cb, Err(error.clone()))),
                ReadDest::Into(_, cb) => dones.push(Done::ReadInto(cb, Err(error.clone()))),
            }
        }
        st.assembly.reset();

        if let Some(socket) = st.socket.as_ref() {
            self.looper.unregister_fd(socket.as_raw_fd());
        }
        if st.inbox_registered {
            if let Some(inbox) = st.inbox.as_ref() {
                self.looper.unregister_fd(inbox.data_signal_fd());
            }
            st.inbox_registered = false;
        }
        if st.outbox_space_registered {
            if let Some(outbox) = st.outbox.as_ref() {
                self.looper.unregister_fd(outbox.space_signal_fd());
            }
            st.outbox_space_registered = false;
        }

        // Dropping the rings unmaps our view of the segments; the
        // peer's mapping stays valid and it observes the socket EOF.
        st.socket = None;
        st.inbox = None;
        st.outbox = None;
        st.phase = ConnectionState::Closed;
    }

    fn process_writes(self: &Arc<Self>, st: &mut ShmConnState, dones: &mut Vec<Done>) {
        if st.phase != ConnectionState::Ready {
            return;
        }
        loop {
            let Some(op) = st.write_ops.front_mut() else {
                return;
            };
            let Some(outbox) = st.outbox.as_ref() else {
                return;
            };

            while op.header_pos < FRAME_HEADER_LEN {
                let n = outbox.produce(&op.header[op.header_pos..]);
                if n == 0 {
                    break;
                }
                op.header_pos += n;
            }
            if op.header_pos == FRAME_HEADER_LEN {
                while op.data_pos < op.data.len() {
                    let n = outbox.produce(&op.data[op.data_pos..]);
                    if n == 0 {
                        break;
                    }
                    op.data_pos += n;
                }
            }

            if op.header_pos == FRAME_HEADER_LEN && op.data_pos == op.data.len() {
                let op = st.write_ops.pop_front().expect("front op exists");
                dones.push(Done::Write(op.callback, Ok(())));
                continue;
            }

            // Ring full: resume when the consumer frees space.
            if !st.outbox_space_registered {
                let fd = outbox.space_signal_fd();
                match self.looper.register_fd(fd, &self.as_handler()) {
                    Ok(()) => st.outbox_space_registered = true,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to watch space doorbell");
                        self.latch_from_loop(st, Error::system("epoll_ctl"), dones);
                    }
                }
            }
            return;
        }
    }

    fn process_reads(self: &Arc<Self>, st: &mut ShmConnState, dones: &mut Vec<Done>) {
        if st.phase != ConnectionState::Ready {
            return;
        }
        while !st.read_ops.is_empty() {
            let Some(inbox) = st.inbox.as_ref() else {
                return;
            };

            if st.assembly.header_fill < FRAME_HEADER_LEN {
                let fill = st.assembly.header_fill;
                let n = inbox.consume_into(&mut st.assembly.header[fill..]);
                if n == 0 {
                    return;
                }
                st.assembly.header_fill += n;
                if st.assembly.header_fill < FRAME_HEADER_LEN {
                    continue;
                }
            }

            let length = u64::from_le_bytes(st.assembly.header) as usize;

            if st.assembly.payload.is_none() {
                let op = st.read_ops.front_mut().expect("read op exists");
                match &mut op.dest {
                    ReadDest::Alloc(_) => {
                        st.assembly.payload = Some(BytesMut::zeroed(length));
                    }
                    ReadDest::Into(buffer, _) => {
                        let buffer = buffer.take().expect("buffer staged once");
                        if buffer.len() != length {
                            let reason = format!(
                                "read destination is {} bytes but inbound frame is {}",
                                buffer.len(),
                                length
                            );
                            self.latch_from_loop(st, Error::ProtocolViolation(reason), dones);
                            return;
                        }
                        st.assembly.payload = Some(buffer);
                    }
                }
            }

            while st.assembly.payload_fill < length {
                let fill = st.assembly.payload_fill;
                let payload = st.assembly.payload.as_mut().expect("payload staged");
                let n = inbox.consume_into(&mut payload[fill..]);
                if n == 0 {
                    return;
                }
                st.assembly.payload_fill += n;
            }

            let payload = st.assembly.payload.take().expect("payload staged");
            st.assembly.reset();
            let op = st.read_ops.pop_front().expect("read op exists");
            match op.dest {
                ReadDest::Alloc(cb) => dones.push(Done::ReadAlloc(cb, Ok(payload.freeze()))),
                ReadDest::Into(_, cb) => dones.push(Done::ReadInto(cb, Ok(payload))),
            }
        }
    }

    fn close_from_loop(self: &Arc<Self>) {
        let mut dones = Vec::new();
        {
            let mut st = self.state.lock();
            self.latch_from_loop(&mut st, Error::ConnectionClosed, &mut dones);
        }
        for done in dones {
            done.fire();
        }
    }
}

impl Connection for ShmConnection {
    fn read(&self, callback: ReadCallback) {
        self.defer(move |conn| {
            let mut dones = Vec::new();
            {
                let mut st = conn.state.lock();
                if let Some(error) = st.error.clone() {
                    dones.push(Done::ReadAlloc(callback, Err(error)));
                } else {
                    st.read_ops.push_back(ReadOp {
                        dest: ReadDest::Alloc(callback),
                    });
                    conn.process_reads(&mut st, &mut dones);
                }
            }
            for done in dones {
                done.fire();
            }
        });
    }

    fn read_into(&self, buffer: BytesMut, callback: ReadIntoCallback) {
        self.defer(move |conn| {
            let mut dones = Vec::new();
            {
                let mut st = conn.state.lock();
                if let Some(error) = st.error.clone() {
                    dones.push(Done::ReadInto(callback, Err(error)));
                } else {
                    st.read_ops.push_back(ReadOp {
                        dest: ReadDest::Into(Some(buffer), callback),
                    });
                    conn.process_reads(&mut st, &mut dones);
                }
            }
            for done in dones {
                done.fire();
            }
        });
    }

    fn write(&self, data: Bytes, callback: WriteCallback) {
        self.defer(move |conn| {
            let mut dones = Vec::new();
            {
                let mut st = conn.state.lock();
                if let Some(error) = st.error.clone() {
                    dones.push(Done::Write(callback, Err(error)));
                } else {
                    st.write_ops.push_back(WriteOp {
                        header: (data.len() as u64).to_le_bytes(),
                        header_pos: 0,
                        data,
                        data_pos: 0,
                        callback,
                    });
                    conn.process_writes(&mut st, &mut dones);
                }
            }
            for done in dones {
                done.fire();
            }
        });
    }

    fn close(&self) {
        self.defer(|conn| conn.close_from_loop());
    }
}

impl EventHandler for ShmConnection {
    fn handle_events(&self, fd: RawFd, _ready: Ready) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        debug_assert!(this.looper.in_loop());

        let mut dones = Vec::new();
        {
            let mut st = this.state.lock();
            let socket_fd = st.socket.as_ref().map(|s| s.as_raw_fd());
            let inbox_fd = st.inbox.as_ref().map(|r| r.data_signal_fd());
            let space_fd = st.outbox.as_ref().map(|r| r.space_signal_fd());

            if Some(fd) == socket_fd {
                if st.phase == ConnectionState::Initializing {
                    this.complete_handshake_from_loop(&mut st, &mut dones);
                } else if st.phase == ConnectionState::Ready {
                    // The only traffic after the handshake is EOF or a
                    // protocol violation.
                    let mut probe = [0u8; 16];
                    if let Some(socket) = st.socket.as_mut() {
                        match socket.read(&mut probe) {
                            Ok(0) => this.latch_from_loop(&mut st, Error::Eof, &mut dones),
                            Ok(_) => this.latch_from_loop(
                                &mut st,
                                Error::ProtocolViolation(
                                    "unexpected bytes on handshake socket".into(),
                                ),
                                &mut dones,
                            ),
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(_) => {
                                this.latch_from_loop(&mut st, Error::system("read"), &mut dones)
                            }
                        }
                    }
                }
            } else if Some(fd) == inbox_fd {
                if let Some(inbox) = st.inbox.as_ref() {
                    let _ = inbox.data_signal().drain();
                }
                this.process_reads(&mut st, &mut dones);
            } else if Some(fd) == space_fd {
                if let Some(outbox) = st.outbox.as_ref() {
                    let _ = outbox.space_signal().drain();
                }
                this.process_writes(&mut st, &mut dones);
            }
        }
        for done in dones {
            done.fire();
        }
    }

    fn handle_close(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        this.close_from_loop();
    }
}
