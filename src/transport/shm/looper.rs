// src/transport/shm/looper.rs

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::doorbell::Doorbell;
use crate::transport::shm::reactor::{Reactor, Token};
use crate::transport::{EventHandler, Ready};

type Task = Box<dyn FnOnce() + Send>;

const EPOLL_CAPACITY: usize = 64;

/// The shared-memory event engine: an epoll thread plus the reactor.
///
/// The epoll thread never runs user code. When a wait returns, it
/// parks the result set in a shared vector, triggers the loop's
/// reactor token, and waits on a condvar until the reactor has
/// dispatched every event; the reactor thread upgrades each weakly
/// held handler for the duration of its callback only. `close` sets an
/// atomic flag and rings the wakeup eventfd; the wait thread keeps
/// running while the flag is unset or any external handler remains
/// registered, and unregistering the last handler wakes it so the
/// termination condition is re-checked.
pub(crate) struct ShmLoop {
    shared: Arc<ShmLoopShared>,
    reactor: Arc<Reactor>,
    epoll_token: Token,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ShmLoopShared {
    epoll_fd: RawFd,
    wakeup: Doorbell,
    closed: AtomicBool,
    handlers: Mutex<HandlerRegistry>,
    rendezvous: Mutex<Vec<(RawFd, Ready)>>,
    rendezvous_done: Condvar,
}

struct HandlerRegistry {
    by_fd: HashMap<RawFd, Weak<dyn EventHandler>>,
}

impl Drop for ShmLoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl ShmLoop {
    pub(crate) fn start(reactor: Arc<Reactor>) -> io::Result<Arc<Self>> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wakeup = Doorbell::new()?;
        let shared = Arc::new(ShmLoopShared {
            epoll_fd,
            wakeup,
            closed: AtomicBool::new(false),
            handlers: Mutex::new(HandlerRegistry {
                by_fd: HashMap::new(),
            }),
            rendezvous: Mutex::new(Vec::new()),
            rendezvous_done: Condvar::new(),
        });

        // The wakeup eventfd is internal: it is watched by epoll but
        // not counted as a handler, and the dispatch pass drains it.
        shared.epoll_add(shared.wakeup.as_raw_fd())?;

        let dispatch_shared = Arc::clone(&shared);
        let epoll_token = reactor.add(Arc::new(move || {
            dispatch_shared.dispatch_from_reactor();
        }));

        let wait_shared = Arc::clone(&shared);
        let wait_reactor = Arc::clone(&reactor);
        let handle = thread::Builder::new()
            .name("ferry-shm-loop".into())
            .spawn(move || run_wait_loop(wait_shared, wait_reactor, epoll_token))?;

        Ok(Arc::new(ShmLoop {
            shared,
            reactor,
            epoll_token,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn in_loop(&self) -> bool {
        self.reactor.in_loop()
    }

    pub(crate) fn defer_to_loop(&self, task: Task) {
        self.reactor.defer_to_loop(task);
    }

    /// Watch `fd` for readability and associate a weakly-held handler.
    /// Must run on the loop (reactor) thread.
    pub(crate) fn register_fd(&self, fd: RawFd, handler: &Arc<dyn EventHandler>) -> io::Result<()> {
        debug_assert!(self.in_loop());
        {
            let mut registry = self.shared.handlers.lock();
            registry.by_fd.insert(fd, Arc::downgrade(handler));
        }
        self.shared.epoll_add(fd)
    }

    /// Idempotent. Unregistering the last handler wakes the wait
    /// thread so it can re-check its termination condition.
    pub(crate) fn unregister_fd(&self, fd: RawFd) {
        let remaining = {
            let mut registry = self.shared.handlers.lock();
            if registry.by_fd.remove(&fd).is_none() {
                return;
            }
            registry.by_fd.len()
        };
        let rv = unsafe {
            libc::epoll_ctl(
                self.shared.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if rv < 0 {
            tracing::warn!(fd, "epoll del failed: {}", io::Error::last_os_error());
        }
        if remaining == 0 {
            let _ = self.shared.wakeup.ring();
        }
    }

    pub(crate) fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shared.wakeup.ring();
        }
    }

    pub(crate) fn join(&self) {
        self.close();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.reactor.remove(self.epoll_token);
        self.reactor.join();
    }
}

impl ShmLoopShared {
    fn epoll_add(&self, fd: RawFd) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };
        let rv = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) };
        if rv < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                let rv = unsafe {
                    libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event)
                };
                if rv < 0 {
                    return Err(io::Error::last_os_error());
                }
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// The reactor-side half of the rendezvous: dispatch the parked
    /// events and signal the wait thread.
    fn dispatch_from_reactor(&self) {
        let events: Vec<(RawFd, Ready)> = {
            let mut rendezvous = self.rendezvous.lock();
            rendezvous.drain(..).collect()
        };

        for (fd, ready) in &events {
            if *fd == self.wakeup.as_raw_fd() {
                let _ = self.wakeup.drain();
                continue;
            }
            // Re-check registration per event so a handler that
            // unregistered itself earlier in this batch stays silent.
            let handler = self.handlers.lock().by_fd.get(fd).and_then(Weak::upgrade);
            if let Some(handler) = handler {
                handler.handle_events(*fd, *ready);
            }
        }

        // Let the wait thread know the batch is done.
        let _ = self.rendezvous.lock();
        self.rendezvous_done.notify_all();
    }
}

fn run_wait_loop(shared: Arc<ShmLoopShared>, reactor: Arc<Reactor>, epoll_token: Token) {
    tracing::debug!("shm loop started");
    let mut buf = vec![
        libc::epoll_event { events: 0, u64: 0 };
        EPOLL_CAPACITY
    ];

    loop {
        let external = shared.handlers.lock().by_fd.len();
        if shared.closed.load(Ordering::Acquire) && external == 0 {
            break;
        }

        let nfds = unsafe {
            libc::epoll_wait(
                shared.epoll_fd,
                buf.as_mut_ptr(),
                EPOLL_CAPACITY as i32,
                -1,
            )
        };
        if nfds < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(error = %err, "epoll_wait failed");
            break;
        }
        if nfds == 0 {
            continue;
        }

        {
            let mut rendezvous = shared.rendezvous.lock();
            for event in &buf[..nfds as usize] {
                let mut ready = Ready::empty();
                if event.events & (libc::EPOLLIN as u32) != 0 {
                    ready |= Ready::READABLE;
                }
                if event.events & (libc::EPOLLOUT as u32) != 0 {
                    ready |= Ready::WRITABLE;
                }
                if event.events & (libc::EPOLLERR as u32) != 0 {
                    ready |= Ready::ERROR;
                }
                if event.events & (libc::EPOLLHUP as u32) != 0 {
                    ready |= Ready::HUP;
                }
                rendezvous.push((event.u64 as RawFd, ready));
            }

            // Hand the batch to the reactor and wait for it to finish
            // dispatching before the next epoll_wait.
            reactor.trigger(epoll_token);
            while !rendezvous.is_empty() {
                shared.rendezvous_done.wait(&mut rendezvous);
            }
        }
    }
    tracing::debug!("shm loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Watcher {
        fired: AtomicUsize,
        tx: Mutex<mpsc::Sender<RawFd>>,
    }

    impl EventHandler for Watcher {
        fn handle_events(&self, fd: RawFd, ready: Ready) {
            assert!(ready.contains(Ready::READABLE));
            self.fired.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.lock().send(fd);
        }

        fn handle_close(&self) {}
    }

    #[test]
    fn dispatches_eventfd_readability() {
        let reactor = Reactor::start().unwrap();
        let looper = ShmLoop::start(reactor).unwrap();

        let doorbell = Arc::new(Doorbell::new().unwrap());
        let (tx, rx) = mpsc::channel();
        let watcher = Arc::new(Watcher {
            fired: AtomicUsize::new(0),
            tx: Mutex::new(tx),
        });

        let looper2 = Arc::clone(&looper);
        let watcher2: Arc<dyn EventHandler> = watcher.clone();
        let doorbell2 = Arc::clone(&doorbell);
        looper.defer_to_loop(Box::new(move || {
            looper2
                .register_fd(doorbell2.as_raw_fd(), &watcher2)
                .unwrap();
        }));

        doorbell.ring().unwrap();
        let fd = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(fd, doorbell.as_raw_fd());

        // Drain so the level-triggered fd goes quiet, then unregister
        // from the loop thread and shut down.
        doorbell.drain().unwrap();
        let looper2 = Arc::clone(&looper);
        let fd = doorbell.as_raw_fd();
        looper.defer_to_loop(Box::new(move || looper2.unregister_fd(fd)));
        looper.join();
        assert!(watcher.fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn join_with_no_handlers_returns() {
        let reactor = Reactor::start().unwrap();
        let looper = ShmLoop::start(reactor).unwrap();
        looper.join();
    }

    #[test]
    fn defer_runs_on_reactor_thread() {
        let reactor = Reactor::start().unwrap();
        let looper = ShmLoop::start(reactor).unwrap();
        let (tx, rx) = mpsc::channel();
        let looper2 = Arc::clone(&looper);
        looper.defer_to_loop(Box::new(move || {
            tx.send(looper2.in_loop()).unwrap();
        }));
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        looper.join();
    }
}
