// src/transport/shm/listener.rs

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::callback::RearmableCallback;
use crate::closing::{ClosingEmitter, ClosingReceiver};
use crate::error::{Error, Result};
use crate::transport::shm::connection::ShmConnection;
use crate::transport::shm::looper::ShmLoop;
use crate::transport::{AcceptCallback, Connection, EventHandler, Listener, Ready};

/// A Unix-socket listener for the shared-memory transport. Accepting a
/// socket immediately starts the ring handshake on the new connection.
pub(crate) struct ShmListener {
    looper: Arc<ShmLoop>,
    weak_self: Weak<ShmListener>,
    emitter: Arc<ClosingEmitter>,
    ring_capacity: usize,
    pending: RearmableCallback<Result<Arc<dyn Connection>>>,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    listener: Option<UnixListener>,
    path: String,
    registered: bool,
    error: Option<Error>,
    closer: Option<ClosingReceiver>,
}

impl ShmListener {
    pub(crate) fn bind(
        looper: Arc<ShmLoop>,
        path: &str,
        ring_capacity: usize,
        emitter: Arc<ClosingEmitter>,
    ) -> Result<Arc<Self>> {
        let listener = UnixListener::bind(path).map_err(|_| Error::system("bind"))?;
        listener
            .set_nonblocking(true)
            .map_err(|_| Error::system("fcntl"))?;

        let this = Arc::new_cyclic(|weak| ShmListener {
            looper: Arc::clone(&looper),
            weak_self: weak.clone(),
            emitter: Arc::clone(&emitter),
            ring_capacity,
            pending: RearmableCallback::new(),
            state: Mutex::new(ListenerState {
                listener: Some(listener),
                path: path.to_string(),
                registered: false,
                error: None,
                closer: None,
            }),
        });
        this.attach_closer(emitter);
        Ok(this)
    }

    fn attach_closer(self: &Arc<Self>, emitter: Arc<ClosingEmitter>) {
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

    fn sync_registration_from_loop(self: &Arc<Self>) {
        debug_assert!(self.looper.in_loop());
        let mut st = self.state.lock();
        if st.error.is_some() {
            return;
        }
        let want = self.pending.armed() > 0;
        let Some(listener) = st.listener.as_ref() else {
            return;
        };
        let fd = listener.as_raw_fd();
        match (st.registered, want) {
            (false, true) => {
                let as_handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
                match self.looper.register_fd(fd, &as_handler) {
                    Ok(()) => st.registered = true,
                    Err(e) => tracing::warn!(error = %e, "failed to watch listener socket"),
                }
            }
            (true, false) => {
                self.looper.unregister_fd(fd);
                st.registered = false;
            }
            _ => {}
        }
    }

    fn close_from_loop(&self) {
        let mut st = self.state.lock();
        if st.error.is_some() {
            return;
        }
        st.error = Some(Error::ConnectionClosed);
        if let (Some(listener), true) = (st.listener.as_ref(), st.registered) {
            self.looper.unregister_fd(listener.as_raw_fd());
        }
        st.registered = false;
        st.listener = None;
        let _ = std::fs::remove_file(&st.path);
        drop(st);

        self.pending.trigger_all(|| Err(Error::ConnectionClosed));
    }
}

impl Listener for ShmListener {
    fn accept(&self, callback: AcceptCallback) {
        self.defer(move |listener| {
            let error = listener.state.lock().error.clone();
            if let Some(error) = error {
                callback(Err(error));
                return;
            }
            listener.pending.arm(callback);
            listener.sync_registration_from_loop();
        });
    }

    fn addr(&self) -> String {
        self.state.lock().path.clone()
    }

    fn close(&self) {
        self.defer(|listener| listener.close_from_loop());
    }
}

impl EventHandler for ShmListener {
    fn handle_events(&self, _fd: RawFd, ready: Ready) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        debug_assert!(this.looper.in_loop());
        if !ready.intersects(Ready::READABLE | Ready::ERROR | Ready::HUP) {
            return;
        }

        loop {
            if this.pending.armed() == 0 {
                break;
            }
            let accepted = {
                let st = this.state.lock();
                match st.listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((socket, _peer)) => {
                    tracing::debug!("accepted shm connection");
                    let connection = ShmConnection::new(
                        Arc::clone(&this.looper),
                        socket,
                        this.ring_capacity,
                    );
                    connection.attach_closer(Arc::clone(&this.emitter));
                    this.pending.trigger(Ok(connection as Arc<dyn Connection>));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    this.pending.trigger(Err(Error::SystemError {
                        syscall: "accept",
                        errno: e.raw_os_error().unwrap_or(0),
                    }));
                    break;
                }
            }
        }
        this.sync_registration_from_loop();
    }

    fn handle_close(&self) {
        self.close_from_loop();
    }
}
