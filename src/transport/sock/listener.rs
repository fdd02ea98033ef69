// src/transport/sock/listener.rs

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use mio::net::TcpListener;
use mio::{Interest, Token};
use parking_lot::Mutex;

use crate::callback::RearmableCallback;
use crate::closing::{ClosingEmitter, ClosingReceiver};
use crate::error::{Error, Result};
use crate::transport::sock::connection::SockConnection;
use crate::transport::sock::looper::SockLoop;
use crate::transport::{AcceptCallback, Connection, EventHandler, Listener, Ready};

/// An accepting TCP endpoint.
///
/// Accept callbacks pair with incoming connections first-in first-out
/// through a rearmable callback. The listening socket is registered
/// with the loop only while at least one callback is armed, so an idle
/// listener does not accept (and then strand) connections.
pub(crate) struct SockListener {
    looper: Arc<SockLoop>,
    weak_self: Weak<SockListener>,
    emitter: Arc<ClosingEmitter>,
    pending: RearmableCallback<Result<Arc<dyn Connection>>>,
    state: Mutex<ListenerState>,
}

struct ListenerState {
    listener: Option<TcpListener>,
    token: Token,
    local_addr: SocketAddr,
    registered: bool,
    error: Option<Error>,
    closer: Option<ClosingReceiver>,
}

impl SockListener {
    pub(crate) fn bind(
        looper: Arc<SockLoop>,
        addr: &str,
        emitter: Arc<ClosingEmitter>,
    ) -> Result<Arc<Self>> {
        let sockaddr: SocketAddr = addr.parse().map_err(|_| Error::SystemError {
            syscall: "bind",
            errno: libc::EINVAL,
        })?;
        let listener = TcpListener::bind(sockaddr).map_err(|_| Error::system("bind"))?;
        let local_addr = listener.local_addr().map_err(|_| Error::system("getsockname"))?;

        let token = looper.allocate_token();
        let this = Arc::new_cyclic(|weak| SockListener {
            looper: Arc::clone(&looper),
            weak_self: weak.clone(),
            emitter: Arc::clone(&emitter),
            pending: RearmableCallback::new(),
            state: Mutex::new(ListenerState {
                listener: Some(listener),
                token,
                local_addr,
                registered: false,
                error: None,
                closer: None,
            }),
        });

        let init = Arc::clone(&this);
        looper.defer_to_loop(Box::new(move || {
            let st = init.state.lock();
            let fd = st
                .listener
                .as_ref()
                .map(|l| std::os::fd::AsRawFd::as_raw_fd(l))
                .unwrap_or(-1);
            let token = st.token;
            drop(st);
            let as_handler: Arc<dyn EventHandler> = Arc::clone(&init) as Arc<dyn EventHandler>;
            init.looper.add_handler(token, fd, &as_handler);
        }));
        this.attach_closer(emitter);
        Ok(this)
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

    fn attach_closer(self: &Arc<Self>, emitter: Arc<ClosingEmitter>) {
        let mut receiver = ClosingReceiver::new(emitter);
        receiver.activate(self);
        self.state.lock().closer = Some(receiver);
    }

    fn sync_registration_from_loop(&self) {
        debug_assert!(self.looper.in_loop());
        let mut st = self.state.lock();
        if st.error.is_some() {
            return;
        }
        let want = self.pending.armed() > 0;
        let registered = st.registered;
        let token = st.token;
        let Some(listener) = st.listener.as_mut() else {
            return;
        };
        let registry = self.looper.registry();
        let outcome = match (registered, want) {
            (false, true) => registry.register(listener, token, Interest::READABLE),
            (true, false) => registry.deregister(listener),
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            tracing::warn!(error = %e, "failed to update listener registration");
        } else {
            st.registered = want;
        }
    }

    fn close_from_loop(&self) {
        let mut st = self.state.lock();
        if st.error.is_some() {
            return;
        }
        st.error = Some(Error::ConnectionClosed);
        let registered = st.registered;
        if let (Some(listener), true) = (st.listener.as_mut(), registered) {
            let _ = self.looper.registry().deregister(listener);
        }
        st.registered = false;
        st.listener = None;
        self.looper.remove_handler(st.token);
        drop(st);

        self.pending.trigger_all(|| Err(Error::ConnectionClosed));
    }
}

impl Listener for SockListener {
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
        self.state.lock().local_addr.to_string()
    }

    fn close(&self) {
        self.defer(|listener| listener.close_from_loop());
    }
}

impl EventHandler for SockListener {
    fn handle_events(&self, _fd: RawFd, ready: Ready) {
        debug_assert!(self.looper.in_loop());
        if !ready.intersects(Ready::READABLE | Ready::ERROR | Ready::HUP) {
            return;
        }

        loop {
            if self.pending.armed() == 0 {
                break;
            }
            let accepted = {
                let st = self.state.lock();
                match st.listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted connection");
                    let connection =
                        SockConnection::from_accepted(Arc::clone(&self.looper), stream);
                    connection.attach_closer(Arc::clone(&self.emitter));
                    self.pending.trigger(Ok(connection as Arc<dyn Connection>));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending.trigger(Err(Error::SystemError {
                        syscall: "accept",
                        errno: e.raw_os_error().unwrap_or(0),
                    }));
                    break;
                }
            }
        }
        self.sync_registration_from_loop();
    }

    fn handle_close(&self) {
        self.close_from_loop();
    }
}
