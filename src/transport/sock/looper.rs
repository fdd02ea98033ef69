// src/transport/sock/looper.rs

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::transport::{EventHandler, Ready};

const WAKER_TOKEN: Token = Token(usize::MAX);

type Task = Box<dyn FnOnce() + Send>;

/// The socket-flavor event engine: one background thread driving a mio
/// poll, a deferred-closure queue, and a registry of weakly-held
/// handlers keyed by token.
///
/// All handler callbacks run on the loop thread, with no engine lock
/// held. Deferrals from any single thread run in submission order. The
/// loop terminates once it has been closed, the registry is empty, and
/// the queue has drained; `join` closes every live handler from within
/// the loop so that termination follows naturally.
pub(crate) struct SockLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct LoopShared {
    registry: mio::Registry,
    waker: Waker,
    deferred: Mutex<VecDeque<Task>>,
    handlers: Mutex<HashMap<Token, (RawFd, Weak<dyn EventHandler>)>>,
    next_token: AtomicUsize,
    closed: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
}

impl SockLoop {
    pub(crate) fn start() -> std::io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let shared = Arc::new(LoopShared {
            registry,
            waker,
            deferred: Mutex::new(VecDeque::new()),
            handlers: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ferry-sock-loop".into())
            .spawn(move || run_loop(poll, thread_shared))?;

        Ok(Arc::new(SockLoop {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn in_loop(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    /// Append a closure to the loop's queue and wake it. Returns before
    /// the closure runs.
    pub(crate) fn defer_to_loop(&self, task: Task) {
        self.shared.deferred.lock().push_back(task);
        let _ = self.shared.waker.wake();
    }

    /// Hand out a fresh registration token.
    pub(crate) fn allocate_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn registry(&self) -> &mio::Registry {
        &self.shared.registry
    }

    /// Associate a weakly-held handler with a token. Must run on the
    /// loop thread.
    pub(crate) fn add_handler(&self, token: Token, fd: RawFd, handler: &Arc<dyn EventHandler>) {
        debug_assert!(self.in_loop());
        self.shared
            .handlers
            .lock()
            .insert(token, (fd, Arc::downgrade(handler)));
    }

    /// Idempotent; wakes the loop so its termination condition is
    /// re-checked.
    pub(crate) fn remove_handler(&self, token: Token) {
        self.shared.handlers.lock().remove(&token);
        let _ = self.shared.waker.wake();
    }

    /// Request termination and wait for the loop thread to exit. Live
    /// handlers are closed from within the loop first.
    pub(crate) fn join(&self) {
        let shared = Arc::clone(&self.shared);
        self.defer_to_loop(Box::new(move || {
            let handlers: Vec<_> = shared
                .handlers
                .lock()
                .values()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            // TODO: only fd-backed handles live in this registry today;
            // if timers grow their own handle kind they need to join
            // this walk.
            for handler in handlers {
                handler.handle_close();
            }
            shared.closed.store(true, Ordering::Release);
        }));

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_loop(mut poll: Poll, shared: Arc<LoopShared>) {
    *shared.loop_thread.lock() = Some(thread::current().id());
    tracing::debug!("sock loop started");

    let mut events = Events::with_capacity(64);
    loop {
        // Drain deferred work before blocking; closures may register
        // handlers or schedule more work.
        loop {
            let task = shared.deferred.lock().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }

        if shared.closed.load(Ordering::Acquire)
            && shared.handlers.lock().is_empty()
            && shared.deferred.lock().is_empty()
        {
            break;
        }

        // A short timeout covers the race where the exit condition
        // became true between the check above and this poll.
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(100))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::warn!(error = %e, "sock loop poll failed");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let mut ready = Ready::empty();
            if event.is_readable() {
                ready |= Ready::READABLE;
            }
            if event.is_writable() {
                ready |= Ready::WRITABLE;
            }
            if event.is_error() {
                ready |= Ready::ERROR;
            }
            if event.is_read_closed() || event.is_write_closed() {
                ready |= Ready::HUP;
            }

            // Re-check registration for every event: a handler that
            // unregistered itself earlier in this batch must not fire.
            let entry = shared
                .handlers
                .lock()
                .get(&event.token())
                .map(|(fd, weak)| (*fd, weak.upgrade()));
            if let Some((fd, Some(handler))) = entry {
                // The upgrade above keeps the handler alive for the
                // duration of this dispatch only.
                handler.handle_events(fd, ready);
            }
        }
    }

    // One final non-blocking pass so close callbacks queued by the
    // shutdown walk still run.
    loop {
        let task = shared.deferred.lock().pop_front();
        match task {
            Some(task) => task(),
            None => break,
        }
    }
    tracing::debug!("sock loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn defers_run_in_order() {
        let looper = SockLoop::start().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            looper.defer_to_loop(Box::new(move || tx.send(i).unwrap()));
        }
        for i in 0..5 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), i);
        }
        looper.join();
    }

    struct SelfRemoving {
        closes: AtomicUsize,
        looper: Mutex<Option<Arc<SockLoop>>>,
        token: Token,
    }

    impl EventHandler for SelfRemoving {
        fn handle_events(&self, _fd: RawFd, _ready: Ready) {}

        fn handle_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if let Some(looper) = self.looper.lock().take() {
                looper.remove_handler(self.token);
            }
        }
    }

    #[test]
    fn join_closes_live_handlers() {
        let looper = SockLoop::start().unwrap();
        let token = looper.allocate_token();
        let handler = Arc::new(SelfRemoving {
            closes: AtomicUsize::new(0),
            looper: Mutex::new(Some(Arc::clone(&looper))),
            token,
        });

        let (tx, rx) = mpsc::channel();
        let looper2 = Arc::clone(&looper);
        let as_dyn: Arc<dyn EventHandler> = handler.clone();
        looper.defer_to_loop(Box::new(move || {
            looper2.add_handler(token, -1, &as_dyn);
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(1)).unwrap();

        looper.join();
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_loop_is_accurate() {
        let looper = SockLoop::start().unwrap();
        assert!(!looper.in_loop());
        let (tx, rx) = mpsc::channel();
        let looper2 = Arc::clone(&looper);
        looper.defer_to_loop(Box::new(move || {
            tx.send(looper2.in_loop()).unwrap();
        }));
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        looper.join();
    }
}
