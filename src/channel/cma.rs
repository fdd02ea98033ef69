// src/channel/cma.rs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::callback::{lazy, CallbackSubject, TaskSerializer};
use crate::channel::{
    Channel, ChannelFactory, DescriptorCallback, Endpoint, RecvCallback, SendCallback,
};
use crate::closing::{Closable, ClosingEmitter, ClosingReceiver};
use crate::codec;
use crate::error::{Error, Result};
use crate::transport::Connection;

/// Read the machine's boot id, the host-identity half of the domain
/// descriptor.
fn boot_id() -> Result<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .map_err(|_| Error::system("open"))?;
    Ok(raw.trim().to_string())
}

/// The out-of-band descriptor: enough for the peer to read the payload
/// straight out of our address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Descriptor {
    operation_id: u64,
    pid: i32,
    ptr: u64,
}

/// The only control packet: the receiver confirming that the copy is
/// done and the sender may release the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Packet {
    Notification { operation_id: u64 },
}

/// One queued cross-process copy.
struct CopyRequest {
    remote_pid: i32,
    remote_ptr: u64,
    local_ptr: u64,
    length: usize,
    callback: Box<dyn FnOnce(Result<()>) + Send>,
}

/// The single-threaded copy worker shared by every channel of one
/// factory. Requests queue on an unbounded channel with a blocking
/// pop; a `None` poisons the queue and stops the thread.
struct CopyWorker {
    sender: crossbeam_channel::Sender<Option<CopyRequest>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CopyWorker {
    fn start() -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Option<CopyRequest>>();
        let thread = thread::Builder::new()
            .name("ferry-cma-loop".into())
            .spawn(move || {
                while let Ok(Some(request)) = receiver.recv() {
                    let outcome = copy_from_process(&request);
                    (request.callback)(outcome);
                }
            })?;
        Ok(CopyWorker {
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, request: CopyRequest) {
        if self.sender.send(Some(request)).is_err() {
            tracing::warn!("copy request dropped: worker already stopped");
        }
    }

    fn stop(&self) {
        let _ = self.sender.send(None);
    }

    fn join(&self) {
        self.stop();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// One vectorized cross-process read: a single source iovec in the
/// remote process, a single destination iovec here.
fn copy_from_process(request: &CopyRequest) -> Result<()> {
    let local = libc::iovec {
        iov_base: request.local_ptr as *mut libc::c_void,
        iov_len: request.length,
    };
    let remote = libc::iovec {
        iov_base: request.remote_ptr as *mut libc::c_void,
        iov_len: request.length,
    };
    // Safety: the destination buffer is owned by a pending recv
    // operation and outlives this request; the remote range is only
    // described, not dereferenced, on our side.
    let nread = unsafe {
        libc::process_vm_readv(request.remote_pid, &local, 1, &remote, 1, 0)
    };
    if nread < 0 {
        return Err(Error::system("process_vm_readv"));
    }
    let nread = nread as usize;
    if nread != request.length {
        return Err(Error::short_read(request.length, nread));
    }
    Ok(())
}

struct SendOperation {
    id: u64,
    /// Keeps the payload bytes alive and at a stable address until the
    /// peer confirms its copy.
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

/// A channel that moves payloads with one cross-memory-attach read on
/// the receiving side; the control connection only carries the
/// completion notifications.
pub struct CmaChannel {
    connection: Arc<dyn Connection>,
    worker: Arc<CopyWorker>,
    serializer: TaskSerializer,
    weak_self: Weak<CmaChannel>,
    state: Mutex<ChannelState>,
}

impl CmaChannel {
    fn new(
        connection: Arc<dyn Connection>,
        worker: Arc<CopyWorker>,
        emitter: Arc<ClosingEmitter>,
    ) -> Arc<Self> {
        let channel = Arc::new_cyclic(|weak| CmaChannel {
            connection,
            worker,
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

    fn arm_packet_read(self: &Arc<Self>) {
        codec::read_framed::<Packet, _>(
            &self.connection,
            lazy(self, |channel, packet| channel.on_packet(packet)),
        );
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        debug_assert!(self.serializer.in_loop());
        let Packet::Notification { operation_id } = packet;
        self.on_notification(operation_id);
        self.arm_packet_read();
    }

    /// The peer finished copying: release the payload and complete the
    /// send.
    fn on_notification(self: &Arc<Self>, operation_id: u64) {
        let (op, error) = {
            let mut st = self.state.lock();
            let index = st.send_ops.iter().position(|op| op.id == operation_id);
            match index {
                Some(index) => {
                    let op = st.send_ops.remove(index);
                    (op, st.error.clone())
                }
                None => {
                    drop(st);
                    self.latch(Error::ProtocolViolation(format!(
                        "notification for unknown send operation {operation_id}"
                    )));
                    return;
                }
            }
        };
        if let Some(op) = op {
            (op.callback)(match error {
                Some(error) => Err(error),
                None => Ok(()),
            });
        }
    }

    /// The copy worker finished a request for `operation_id`: notify
    /// the peer on success, or collapse the channel on failure, and
    /// complete the recv either way.
    fn copy_finished(self: &Arc<Self>, operation_id: u64, outcome: Result<()>) {
        debug_assert!(self.serializer.in_loop());
        if let Err(error) = outcome {
            if self.latched_error().is_none() {
                self.latch(error);
            }
        }

        let (op, error) = {
            let mut st = self.state.lock();
            let index = st.recv_ops.iter().position(|op| op.id == operation_id);
            let op = index.map(|i| st.recv_ops.remove(i)).flatten();
            (op, st.error.clone())
        };
        let Some(op) = op else {
            // Already drained by the error teardown.
            return;
        };

        match error {
            None => {
                codec::write_framed(
                    &self.connection,
                    &Packet::Notification { operation_id },
                    Box::new(lazy(self, |_channel, ()| {})),
                );
                (op.callback)(Ok(op.buffer.expect("buffer parked on the operation")));
            }
            Some(error) => (op.callback)(Err(error)),
        }
    }

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
        tracing::debug!(error = %error, "cma channel entering error state");
        for op in sends {
            (op.callback)(Err(error.clone()));
        }
        for op in recvs {
            (op.callback)(Err(error.clone()));
        }
    }
}

impl CallbackSubject for CmaChannel {
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

impl Channel for CmaChannel {
    fn send(&self, data: Bytes, descriptor: DescriptorCallback, callback: SendCallback) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.serializer.defer(Box::new(move || {
            let staged = {
                let mut st = this.state.lock();
                if let Some(error) = st.error.clone() {
                    Err((error, callback))
                } else {
                    let id = st.next_operation_id;
                    st.next_operation_id += 1;
                    let ptr = data.as_ptr() as u64;
                    st.send_ops.push_back(SendOperation { id, data, callback });
                    Ok((id, ptr))
                }
            };
            match staged {
                Ok((id, ptr)) => {
                    descriptor(codec::encode(&Descriptor {
                        operation_id: id,
                        pid: std::process::id() as i32,
                        ptr,
                    }));
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
            let parsed = match parsed {
                Ok(parsed) => parsed,
                Err(error) => {
                    callback(Err(error));
                    return;
                }
            };

            let length = buffer.len();
            let local_ptr = buffer.as_ptr() as u64;
            {
                let mut st = this.state.lock();
                if let Some(error) = st.error.clone() {
                    drop(st);
                    callback(Err(error));
                    return;
                }
                st.recv_ops.push_back(RecvOperation {
                    id: parsed.operation_id,
                    buffer: Some(buffer),
                    callback,
                });
            }

            // Hand the copy to the worker; its callback hops back onto
            // this channel's loop.
            let weak = Arc::downgrade(&this);
            let operation_id = parsed.operation_id;
            this.worker.submit(CopyRequest {
                remote_pid: parsed.pid,
                remote_ptr: parsed.ptr,
                local_ptr,
                length,
                callback: Box::new(move |outcome| {
                    let Some(channel) = weak.upgrade() else {
                        return;
                    };
                    let inner = Arc::clone(&channel);
                    channel.serializer.defer(Box::new(move || {
                        inner.copy_finished(operation_id, outcome);
                    }));
                }),
            });
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

impl Closable for CmaChannel {
    fn close(&self) {
        Channel::close(self);
    }
}

/// Factory for [`CmaChannel`]s.
///
/// process_vm_readv is gated by a ptrace access-mode check: the real,
/// effective and saved uids and gids of the two processes must match.
/// The domain descriptor folds the boot id and the effective ids into
/// a string, so endpoints on different hosts or under different users
/// compare unequal and never pair.
pub struct CmaChannelFactory {
    descriptor: String,
    worker: Arc<CopyWorker>,
    emitter: Arc<ClosingEmitter>,
    closed: AtomicBool,
    joined: AtomicBool,
}

impl CmaChannelFactory {
    pub fn new() -> Result<Arc<Self>> {
        let boot_id = boot_id()?;
        let descriptor = format!("cma:{}/{}/{}", boot_id, unsafe { libc::geteuid() }, unsafe {
            libc::getegid()
        });
        let worker = CopyWorker::start().map_err(Error::from)?;
        Ok(Arc::new(CmaChannelFactory {
            descriptor,
            worker: Arc::new(worker),
            emitter: Arc::new(ClosingEmitter::new()),
            closed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        }))
    }
}

impl ChannelFactory for CmaChannelFactory {
    fn domain_descriptor(&self) -> &str {
        &self.descriptor
    }

    fn create_channel(
        &self,
        connection: Arc<dyn Connection>,
        _endpoint: Endpoint,
    ) -> Arc<dyn Channel> {
        CmaChannel::new(
            connection,
            Arc::clone(&self.worker),
            Arc::clone(&self.emitter),
        )
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("cma channel factory closing");
            self.emitter.close();
            self.worker.stop();
        }
    }

    fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::SeqCst) {
            self.worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_descriptor_shape() {
        let factory = CmaChannelFactory::new().unwrap();
        let descriptor = factory.domain_descriptor();
        assert!(descriptor.starts_with("cma:"));
        assert_eq!(descriptor.matches('/').count(), 2);
        // Two factories in one process always agree.
        let other = CmaChannelFactory::new().unwrap();
        assert_eq!(descriptor, other.domain_descriptor());
        factory.join();
        other.join();
    }

    #[test]
    fn copy_within_own_process() {
        let source = vec![0xabu8; 512];
        let mut dest = vec![0u8; 512];
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = CopyWorker::start().unwrap();
        worker.submit(CopyRequest {
            remote_pid: std::process::id() as i32,
            remote_ptr: source.as_ptr() as u64,
            local_ptr: dest.as_mut_ptr() as u64,
            length: source.len(),
            callback: Box::new(move |outcome| tx.send(outcome).unwrap()),
        });

        rx.recv_timeout(std::time::Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(dest, source);
        worker.join();
    }

    #[test]
    fn copy_from_unmapped_address_fails() {
        let mut dest = vec![0u8; 64];
        let (tx, rx) = std::sync::mpsc::channel();

        let worker = CopyWorker::start().unwrap();
        worker.submit(CopyRequest {
            remote_pid: std::process::id() as i32,
            // Page zero is never mapped.
            remote_ptr: 8,
            local_ptr: dest.as_mut_ptr() as u64,
            length: dest.len(),
            callback: Box::new(move |outcome| tx.send(outcome).unwrap()),
        });

        let outcome = rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            outcome,
            Err(Error::SystemError { .. }) | Err(Error::ShortRead { .. })
        ));
        worker.join();
    }

    #[test]
    fn short_read_maps_to_short_read_error() {
        // A source that ends at a page boundary: map two pages, then
        // punch out the second so a read crossing the boundary comes
        // back short (or faults outright, depending on the kernel).
        let page = 4096;
        let mapped = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page * 2,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(mapped, libc::MAP_FAILED);
        unsafe {
            assert_eq!(libc::munmap((mapped as *mut u8).add(page) as *mut libc::c_void, page), 0);
        }

        let mut dest = vec![0u8; page * 2];
        let request = CopyRequest {
            remote_pid: std::process::id() as i32,
            remote_ptr: mapped as u64,
            local_ptr: dest.as_mut_ptr() as u64,
            length: page * 2,
            callback: Box::new(|_| {}),
        };
        let outcome = copy_from_process(&request);
        assert!(matches!(
            outcome,
            Err(Error::ShortRead { .. }) | Err(Error::SystemError { .. })
        ));

        unsafe {
            libc::munmap(mapped, page);
        }
    }
}
