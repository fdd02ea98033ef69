// src/transport/shm/reactor.rs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

/// Opaque identifier for a registered reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(u64);

type Task = Box<dyn FnOnce() + Send>;
type Reaction = Arc<dyn Fn() + Send + Sync>;

enum Command {
    Trigger(Token),
    Deferred(Task),
    Remove(Token),
}

/// A token-dispatching auxiliary loop.
///
/// `add` registers a closure and returns its token; `trigger` enqueues
/// one invocation and is safe from any thread; `remove` takes effect
/// only after pending triggers for the token have flushed, because it
/// travels through the same queue. This separates "what happened" (the
/// epoll thread) from "what to do about it" (reactions running here),
/// so the epoll thread never blocks on user work.
pub(crate) struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct ReactorShared {
    state: Mutex<ReactorState>,
    condvar: Condvar,
    next_token: AtomicU64,
    closed: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
}

struct ReactorState {
    reactions: HashMap<Token, Reaction>,
    queue: VecDeque<Command>,
}

impl Reactor {
    pub(crate) fn start() -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(ReactorShared {
            state: Mutex::new(ReactorState {
                reactions: HashMap::new(),
                queue: VecDeque::new(),
            }),
            condvar: Condvar::new(),
            next_token: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("ferry-shm-reactor".into())
            .spawn(move || run_reactor(thread_shared))?;

        Ok(Arc::new(Reactor {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    pub(crate) fn in_loop(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    pub(crate) fn add(&self, reaction: Reaction) -> Token {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared.state.lock().reactions.insert(token, reaction);
        token
    }

    /// Enqueue one invocation of the reaction behind `token`.
    pub(crate) fn trigger(&self, token: Token) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(Command::Trigger(token));
        self.shared.condvar.notify_all();
    }

    /// Remove the reaction once pending triggers have flushed.
    pub(crate) fn remove(&self, token: Token) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(Command::Remove(token));
        self.shared.condvar.notify_all();
    }

    /// Run a closure on the reactor thread. Returns before it runs.
    pub(crate) fn defer_to_loop(&self, task: Task) {
        let mut state = self.shared.state.lock();
        state.queue.push_back(Command::Deferred(task));
        self.shared.condvar.notify_all();
    }

    pub(crate) fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.condvar.notify_all();
        }
    }

    pub(crate) fn join(&self) {
        self.close();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn run_reactor(shared: Arc<ReactorShared>) {
    *shared.loop_thread.lock() = Some(thread::current().id());
    tracing::debug!("shm reactor started");

    loop {
        let command = {
            let mut state = shared.state.lock();
            loop {
                if let Some(command) = state.queue.pop_front() {
                    break Some(command);
                }
                if shared.closed.load(Ordering::Acquire) {
                    break None;
                }
                shared.condvar.wait(&mut state);
            }
        };

        let Some(command) = command else {
            break;
        };
        match command {
            Command::Trigger(token) => {
                // Clone the reaction out so it runs without the lock.
                let reaction = shared.state.lock().reactions.get(&token).cloned();
                if let Some(reaction) = reaction {
                    reaction();
                }
            }
            Command::Deferred(task) => task(),
            Command::Remove(token) => {
                shared.state.lock().reactions.remove(&token);
            }
        }
    }
    tracing::debug!("shm reactor stopped");
}
