// src/callback.rs

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send>;

/// An on-demand serializing executor.
///
/// The first thread to submit while the queue is idle becomes the
/// drain thread and runs tasks until the queue empties; submissions
/// from other threads (or re-entrant ones from a running task) are
/// appended and picked up by the current drain. This gives every
/// object a "loop" identity without a dedicated thread: all state
/// mutations funnel through `defer`, and `in_loop` identifies the
/// drain thread for assertions.
pub(crate) struct TaskSerializer {
    inner: Mutex<SerializerInner>,
}

struct SerializerInner {
    tasks: VecDeque<Task>,
    running_on: Option<ThreadId>,
}

impl TaskSerializer {
    pub(crate) fn new() -> Self {
        TaskSerializer {
            inner: Mutex::new(SerializerInner {
                tasks: VecDeque::new(),
                running_on: None,
            }),
        }
    }

    pub(crate) fn in_loop(&self) -> bool {
        self.inner.lock().running_on == Some(thread::current().id())
    }

    pub(crate) fn defer(&self, task: Task) {
        {
            let mut inner = self.inner.lock();
            inner.tasks.push_back(task);
            if inner.running_on.is_some() {
                return;
            }
            inner.running_on = Some(thread::current().id());
        }

        loop {
            let task = {
                let mut inner = self.inner.lock();
                match inner.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        inner.running_on = None;
                        return;
                    }
                }
            };
            task();
        }
    }
}

/// An object that owns a serializing loop and latches its first error.
///
/// `latch` records the error and runs the subject's `handle_error`
/// exactly once; later errors are dropped. Implementors call it only
/// from within their own loop.
pub(crate) trait CallbackSubject: Send + Sync {
    fn defer(&self, task: Task);

    fn latched_error(&self) -> Option<Error>;

    fn latch(&self, error: Error);
}

/// Wrap `fn` so that it only runs if `subject` is still alive at
/// invocation time. The upgrade is held across the call, so a subject
/// dropped concurrently survives until the callback returns.
pub fn run_if_alive<S, F>(subject: &Arc<S>, f: F) -> impl FnOnce() + Send
where
    S: Send + Sync + 'static,
    F: FnOnce(&Arc<S>) + Send + 'static,
{
    let weak = Arc::downgrade(subject);
    move || {
        if let Some(subject) = weak.upgrade() {
            f(&subject);
        }
    }
}

/// Build a completion for an infrastructure operation (protocol packet
/// I/O). The subject is captured weakly; the continuation is deferred
/// into the subject's loop and runs only when the subject is alive, not
/// yet errored, and the operation succeeded. A failure latches the
/// subject instead of reaching the continuation.
pub(crate) fn lazy<S, T, F>(subject: &Arc<S>, f: F) -> impl FnOnce(Result<T>) + Send
where
    S: CallbackSubject + 'static,
    T: Send + 'static,
    F: FnOnce(&Arc<S>, T) + Send + 'static,
{
    let weak = Arc::downgrade(subject);
    move |result: Result<T>| {
        let Some(subject) = weak.upgrade() else {
            return;
        };
        let weak: Weak<S> = Arc::downgrade(&subject);
        subject.defer(Box::new(move || {
            let Some(subject) = weak.upgrade() else {
                return;
            };
            if subject.latched_error().is_some() {
                return;
            }
            match result {
                Err(error) => subject.latch(error),
                Ok(value) => f(&subject, value),
            }
        }));
    }
}

/// Build a completion for a resource-bearing operation (user payload
/// I/O). The subject is captured strongly, and the continuation always
/// runs so the resource can be released; a failure latches the subject
/// first, and the continuation observes it through the subject's error
/// state. On failure the continuation receives `None`.
pub(crate) fn eager<S, T, F>(subject: &Arc<S>, f: F) -> impl FnOnce(Result<T>) + Send
where
    S: CallbackSubject + 'static,
    T: Send + 'static,
    F: FnOnce(&Arc<S>, Option<T>) + Send + 'static,
{
    let strong = Arc::clone(subject);
    move |result: Result<T>| {
        let subject = Arc::clone(&strong);
        strong.defer(Box::new(move || {
            let value = match result {
                Err(error) => {
                    if subject.latched_error().is_none() {
                        subject.latch(error);
                    }
                    None
                }
                Ok(value) => Some(value),
            };
            f(&subject, value);
        }));
    }
}

/// A one-shot continuation slot paired with an argument queue.
///
/// `arm` and `trigger` pair callbacks with argument sets first-in
/// first-out; whichever side arrives first queues up. At any time at
/// most one of the two queues is non-empty. `trigger_all` flushes every
/// queued callback, feeding each from the generator; it is the flush
/// path for error teardown.
pub struct RearmableCallback<T> {
    inner: Mutex<RearmableInner<T>>,
}

struct RearmableInner<T> {
    callbacks: VecDeque<Box<dyn FnOnce(T) + Send>>,
    stashed: VecDeque<T>,
}

impl<T> Default for RearmableCallback<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RearmableCallback<T> {
    pub fn new() -> Self {
        RearmableCallback {
            inner: Mutex::new(RearmableInner {
                callbacks: VecDeque::new(),
                stashed: VecDeque::new(),
            }),
        }
    }

    pub fn arm(&self, f: Box<dyn FnOnce(T) + Send>) {
        let ready = {
            let mut inner = self.inner.lock();
            match inner.stashed.pop_front() {
                Some(args) => Some((f, args)),
                None => {
                    inner.callbacks.push_back(f);
                    None
                }
            }
        };
        if let Some((f, args)) = ready {
            f(args);
        }
    }

    pub fn trigger(&self, args: T) {
        let ready = {
            let mut inner = self.inner.lock();
            match inner.callbacks.pop_front() {
                Some(f) => Some((f, args)),
                None => {
                    inner.stashed.push_back(args);
                    None
                }
            }
        };
        if let Some((f, args)) = ready {
            f(args);
        }
    }

    pub fn trigger_all(&self, mut generator: impl FnMut() -> T) {
        loop {
            let f = {
                let mut inner = self.inner.lock();
                match inner.callbacks.pop_front() {
                    Some(f) => f,
                    None => return,
                }
            };
            f(generator());
        }
    }

    /// Number of callbacks waiting to be triggered.
    pub fn armed(&self) -> usize {
        self.inner.lock().callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn serializer_runs_in_submission_order() {
        let serializer = TaskSerializer::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            serializer.defer(Box::new(move || log.lock().push(i)));
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn serializer_reentrant_defer_runs_after_current_task() {
        let serializer = Arc::new(TaskSerializer::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let s2 = Arc::clone(&serializer);
        let log2 = Arc::clone(&log);
        serializer.defer(Box::new(move || {
            assert!(s2.in_loop());
            let log3 = Arc::clone(&log2);
            s2.defer(Box::new(move || log3.lock().push("inner")));
            log2.lock().push("outer");
        }));

        assert_eq!(*log.lock(), vec!["outer", "inner"]);
        assert!(!serializer.in_loop());
    }

    struct Probe {
        serializer: TaskSerializer,
        error: Mutex<Option<Error>>,
        error_handled: AtomicUsize,
    }

    impl Probe {
        fn new() -> Arc<Self> {
            Arc::new(Probe {
                serializer: TaskSerializer::new(),
                error: Mutex::new(None),
                error_handled: AtomicUsize::new(0),
            })
        }
    }

    impl CallbackSubject for Probe {
        fn defer(&self, task: Task) {
            self.serializer.defer(task);
        }

        fn latched_error(&self) -> Option<Error> {
            self.error.lock().clone()
        }

        fn latch(&self, error: Error) {
            *self.error.lock() = Some(error);
            self.error_handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn run_if_alive_skips_dead_subject() {
        let fired = Arc::new(AtomicUsize::new(0));
        let subject = Probe::new();

        let fired2 = Arc::clone(&fired);
        let cb = run_if_alive(&subject, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        drop(subject);
        cb();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let subject = Probe::new();
        let fired2 = Arc::clone(&fired);
        let cb = run_if_alive(&subject, move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lazy_absorbs_errors() {
        let subject = Probe::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let cb = lazy(&subject, move |_s, _v: ()| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Err(Error::Eof));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(subject.latched_error(), Some(Error::Eof));
        assert_eq!(subject.error_handled.load(Ordering::SeqCst), 1);

        // A second failure is dropped without re-latching.
        let cb = lazy(&subject, |_s, _v: ()| {});
        cb(Err(Error::ConnectionClosed));
        assert_eq!(subject.latched_error(), Some(Error::Eof));
        assert_eq!(subject.error_handled.load(Ordering::SeqCst), 1);

        // Success after the latch is also dropped.
        let fired2 = Arc::clone(&fired);
        let cb = lazy(&subject, move |_s, _v: ()| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lazy_runs_on_success() {
        let subject = Probe::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let cb = lazy(&subject, move |_s, v: u32| {
            assert_eq!(v, 5);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Ok(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eager_always_fires() {
        let subject = Probe::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired2 = Arc::clone(&fired);
        let cb = eager(&subject, move |s, v: Option<u32>| {
            assert!(v.is_none());
            assert_eq!(s.latched_error(), Some(Error::Eof));
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Err(Error::Eof));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Still fires after the latch, with the value when there is one.
        let fired2 = Arc::clone(&fired);
        let cb = eager(&subject, move |_s, v: Option<u32>| {
            assert_eq!(v, Some(9));
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        cb(Ok(9));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(subject.error_handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rearmable_pairs_fifo() {
        let rc: RearmableCallback<u32> = RearmableCallback::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Args first.
        rc.trigger(1);
        rc.trigger(2);
        let log2 = Arc::clone(&log);
        rc.arm(Box::new(move |v| log2.lock().push(("a", v))));
        let log2 = Arc::clone(&log);
        rc.arm(Box::new(move |v| log2.lock().push(("b", v))));

        // Callbacks first.
        let log2 = Arc::clone(&log);
        rc.arm(Box::new(move |v| log2.lock().push(("c", v))));
        rc.trigger(3);

        assert_eq!(*log.lock(), vec![("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(rc.armed(), 0);
    }

    #[test]
    fn rearmable_trigger_all_flushes() {
        let rc: RearmableCallback<Result<u32>> = RearmableCallback::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            rc.arm(Box::new(move |v| {
                assert!(v.is_err());
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        rc.trigger_all(|| Err(Error::ConnectionClosed));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(rc.armed(), 0);
    }
}
