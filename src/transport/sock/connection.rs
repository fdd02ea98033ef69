// src/transport/sock/connection.rs

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::closing::{ClosingEmitter, ClosingReceiver};
use crate::error::{Error, Result};
use crate::transport::sock::looper::SockLoop;
use crate::transport::{
    Connection, ConnectionState, EventHandler, Ready, ReadCallback, ReadIntoCallback,
    WriteCallback,
};

/// Length prefix: a 64-bit little-endian unsigned payload length.
pub(crate) const FRAME_HEADER_LEN: usize = 8;

/// A message-framed connection over a non-blocking TCP stream.
///
/// All state lives behind one mutex and is only touched on the loop
/// thread; public methods defer themselves there. The outbound queue
/// serializes frames, rearming a writable watcher on partial writes;
/// the inbound side assembles the current frame into the head read
/// op's destination.
pub(crate) struct SockConnection {
    looper: Arc<SockLoop>,
    weak_self: Weak<SockConnection>,
    state: Mutex<ConnState>,
}

struct ConnState {
    stream: Option<TcpStream>,
    token: Token,
    phase: ConnectionState,
    registered: Option<Interest>,
    error: Option<Error>,
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

/// A completion ready to fire, collected under the state lock and
/// invoked after releasing it.
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

impl SockConnection {
    /// Wrap a stream accepted by a listener.
    pub(crate) fn from_accepted(looper: Arc<SockLoop>, stream: TcpStream) -> Arc<Self> {
        Self::build(looper, stream, ConnectionState::Ready)
    }

    /// Open a connection towards `addr`; the connect completes on the
    /// loop via a writability event.
    pub(crate) fn connect(looper: Arc<SockLoop>, addr: &str) -> Result<Arc<Self>> {
        let sockaddr: SocketAddr = addr.parse().map_err(|_| Error::SystemError {
            syscall: "connect",
            errno: libc::EINVAL,
        })?;
        let stream = TcpStream::connect(sockaddr).map_err(|_| Error::system("connect"))?;
        Ok(Self::build(looper, stream, ConnectionState::Initializing))
    }

    fn build(looper: Arc<SockLoop>, stream: TcpStream, phase: ConnectionState) -> Arc<Self> {
        let token = looper.allocate_token();
        let connection = Arc::new_cyclic(|weak| SockConnection {
            looper: Arc::clone(&looper),
            weak_self: weak.clone(),
            state: Mutex::new(ConnState {
                stream: Some(stream),
                token,
                phase,
                registered: None,
                error: None,
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

    fn init_from_loop(self: &Arc<Self>) {
        debug_assert!(self.looper.in_loop());
        let mut st = self.state.lock();
        if st.error.is_some() {
            return;
        }
        let fd = st
            .stream
            .as_ref()
            .map(|s| std::os::fd::AsRawFd::as_raw_fd(s))
            .unwrap_or(-1);
        let as_handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
        self.looper.add_handler(st.token, fd, &as_handler);
        self.sync_interest(&mut st);
        drop(st);
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

    /// Subscribe this connection to its transport's close cascade. The
    /// receiver lives on the connection, so dropping the connection
    /// unsubscribes it.
    pub(crate) fn attach_closer(self: &Arc<Self>, emitter: Arc<ClosingEmitter>) {
        let mut receiver = ClosingReceiver::new(emitter);
        receiver.activate(self);
        self.state.lock().closer = Some(receiver);
    }

    /// Compute the interest implied by the queues and (de)register the
    /// stream accordingly.
    fn sync_interest(&self, st: &mut ConnState) {
        let desired = match st.phase {
            ConnectionState::Initializing => Some(Interest::WRITABLE),
            ConnectionState::Ready => {
                let readable = !st.read_ops.is_empty();
                let writable = !st.write_ops.is_empty();
                match (readable, writable) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            }
            _ => None,
        };

        let Some(stream) = st.stream.as_mut() else {
            return;
        };
        let registry = self.looper.registry();
        let outcome = match (st.registered, desired) {
            (None, Some(interest)) => registry.register(stream, st.token, interest),
            (Some(_), None) => registry.deregister(stream),
            (Some(old), Some(interest)) if old != interest => {
                registry.reregister(stream, st.token, interest)
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "failed to update stream registration");
        } else {
            st.registered = desired;
        }
    }

    /// Latch the first error, abort every queued operation, and tear
    /// the stream down. Collected completions fire after the lock
    /// drops.
    fn latch_from_loop(&self, st: &mut ConnState, error: Error, dones: &mut Vec<Done>) {
        if st.error.is_some() {
            return;
        }
        tracing::debug!(error = %error, "connection latched error");
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

        if let (Some(stream), Some(_)) = (st.stream.as_mut(), st.registered) {
            let _ = self.looper.registry().deregister(stream);
        }
        st.registered = None;
        st.stream = None;
        self.looper.remove_handler(st.token);
        st.phase = ConnectionState::Closed;
    }

    fn process_writes(&self, st: &mut ConnState, dones: &mut Vec<Done>) {
        if st.phase != ConnectionState::Ready {
            return;
        }
        'ops: while let Some(op) = st.write_ops.front_mut() {
            let Some(stream) = st.stream.as_ref() else {
                return;
            };
            let mut stream = stream;

            while op.header_pos < FRAME_HEADER_LEN {
                match stream.write(&op.header[op.header_pos..]) {
                    Ok(0) => {
                        self.latch_from_loop(st, Error::system("write"), dones);
                        return;
                    }
                    Ok(n) => op.header_pos += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break 'ops,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        self.latch_from_loop(st, Error::system("write"), dones);
                        return;
                    }
                }
            }
            while op.data_pos < op.data.len() {
                match stream.write(&op.data[op.data_pos..]) {
                    Ok(0) => {
                        self.latch_from_loop(st, Error::system("write"), dones);
                        return;
                    }
                    Ok(n) => op.data_pos += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break 'ops,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        self.latch_from_loop(st, Error::system("write"), dones);
                        return;
                    }
                }
            }

            let op = st.write_ops.pop_front().expect("front op exists");
            dones.push(Done::Write(op.callback, Ok(())));
        }
    }

    fn process_reads(&self, st: &mut ConnState, dones: &mut Vec<Done>) {
        if st.phase != ConnectionState::Ready {
            return;
        }
        while !st.read_ops.is_empty() {
            let Some(stream) = st.stream.as_ref() else {
                return;
            };
            let mut stream = stream;

            // Assemble the 8-byte length prefix.
            if st.assembly.header_fill < FRAME_HEADER_LEN {
                let fill = st.assembly.header_fill;
                match stream.read(&mut st.assembly.header[fill..]) {
                    Ok(0) => {
                        self.latch_from_loop(st, Error::Eof, dones);
                        return;
                    }
                    Ok(n) => st.assembly.header_fill += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        self.latch_from_loop(st, Error::system("read"), dones);
                        return;
                    }
                }
                if st.assembly.header_fill < FRAME_HEADER_LEN {
                    continue;
                }
            }

            let length = u64::from_le_bytes(st.assembly.header) as usize;

            // Stage the destination buffer once the length is known.
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
                match stream.read(&mut payload[fill..]) {
                    Ok(0) => {
                        self.latch_from_loop(st, Error::Eof, dones);
                        return;
                    }
                    Ok(n) => st.assembly.payload_fill += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        self.latch_from_loop(st, Error::system("read"), dones);
                        return;
                    }
                }
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

    fn close_from_loop(&self) {
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

impl Connection for SockConnection {
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
                    conn.sync_interest(&mut st);
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
                    conn.sync_interest(&mut st);
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
                    conn.sync_interest(&mut st);
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

impl EventHandler for SockConnection {
    fn handle_events(&self, _fd: RawFd, ready: Ready) {
        debug_assert!(self.looper.in_loop());
        let mut dones = Vec::new();
        {
            let mut st = self.state.lock();

            if st.phase == ConnectionState::Initializing && ready.intersects(Ready::WRITABLE) {
                enum Probe {
                    Established,
                    StillConnecting,
                    Failed(std::io::Error),
                }
                let outcome = st.stream.as_ref().map(|s| {
                    // take_error surfaces a failed non-blocking connect;
                    // peer_addr distinguishes "done" from a spurious
                    // writable while the handshake is still in flight.
                    match s.take_error() {
                        Ok(Some(e)) | Err(e) => Probe::Failed(e),
                        Ok(None) => match s.peer_addr() {
                            Ok(_) => Probe::Established,
                            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {
                                Probe::StillConnecting
                            }
                            Err(e) => Probe::Failed(e),
                        },
                    }
                });
                match outcome {
                    Some(Probe::Established) => {
                        st.phase = ConnectionState::Ready;
                        tracing::debug!("connection established");
                    }
                    Some(Probe::Failed(e)) => {
                        tracing::debug!(error = %e, "connect failed");
                        self.latch_from_loop(
                            &mut st,
                            Error::SystemError {
                                syscall: "connect",
                                errno: e.raw_os_error().unwrap_or(0),
                            },
                            &mut dones,
                        );
                    }
                    Some(Probe::StillConnecting) | None => {}
                }
            }

            if st.phase == ConnectionState::Ready {
                if ready.intersects(Ready::READABLE | Ready::HUP | Ready::ERROR) {
                    self.process_reads(&mut st, &mut dones);
                }
                if ready.intersects(Ready::WRITABLE) {
                    self.process_writes(&mut st, &mut dones);
                }
                self.sync_interest(&mut st);
            }
        }
        for done in dones {
            done.fire();
        }
    }

    fn handle_close(&self) {
        self.close_from_loop();
    }
}

