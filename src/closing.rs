// src/closing.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callback::run_if_alive;

/// Something that can be told to shut down by its owner.
pub trait Closable: Send + Sync {
    fn close(&self);
}

/// Fan-out point for close cascades.
///
/// A context owns one emitter; every subordinate object (connection,
/// listener, channel) subscribes through a `ClosingReceiver`. Closing
/// the emitter invokes every subscriber once, in token order. The
/// subscriber map is detached under the lock and the closures run
/// after it is released: a subscriber's close may synchronously drop
/// another subscriber, whose receiver then unsubscribes on this same
/// emitter.
pub struct ClosingEmitter {
    inner: Mutex<EmitterInner>,
}

struct EmitterInner {
    closed: bool,
    subscribers: BTreeMap<usize, Box<dyn FnOnce() + Send>>,
}

impl ClosingEmitter {
    pub fn new() -> Self {
        ClosingEmitter {
            inner: Mutex::new(EmitterInner {
                closed: false,
                subscribers: BTreeMap::new(),
            }),
        }
    }

    /// Register a closure under an opaque token. If the emitter already
    /// closed, the closure runs immediately.
    pub fn subscribe(&self, token: usize, f: Box<dyn FnOnce() + Send>) {
        let late = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Some(f)
            } else {
                inner.subscribers.insert(token, f);
                None
            }
        };
        if let Some(f) = late {
            f();
        }
    }

    pub fn unsubscribe(&self, token: usize) {
        self.inner.lock().subscribers.remove(&token);
    }

    /// Idempotent: the first call invokes every subscriber once.
    pub fn close(&self) {
        let subscribers = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            std::mem::take(&mut inner.subscribers)
        };
        for (_, f) in subscribers {
            f();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Default for ClosingEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// The subscription half held by a subordinate object.
///
/// `activate` subscribes the subject's `close` keyed by the subject's
/// address; the subject is looked up weakly, so a subject dropped
/// before the cascade is a no-op. Dropping the receiver unsubscribes.
pub struct ClosingReceiver {
    emitter: Arc<ClosingEmitter>,
    token: Option<usize>,
}

impl ClosingReceiver {
    pub fn new(emitter: Arc<ClosingEmitter>) -> Self {
        ClosingReceiver {
            emitter,
            token: None,
        }
    }

    pub fn activate<T: Closable + 'static>(&mut self, subject: &Arc<T>) {
        debug_assert!(self.token.is_none(), "receiver activated twice");
        let token = Arc::as_ptr(subject) as usize;
        self.token = Some(token);
        self.emitter
            .subscribe(token, Box::new(run_if_alive(subject, |s| s.close())));
    }
}

impl Drop for ClosingReceiver {
    fn drop(&mut self) {
        if let Some(token) = self.token {
            self.emitter.unsubscribe(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Victim {
        closes: AtomicUsize,
    }

    impl Victim {
        fn new() -> Arc<Self> {
            Arc::new(Victim {
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl Closable for Victim {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_is_idempotent_and_fires_once() {
        let emitter = Arc::new(ClosingEmitter::new());
        let victim = Victim::new();

        let mut receiver = ClosingReceiver::new(Arc::clone(&emitter));
        receiver.activate(&victim);

        emitter.close();
        emitter.close();
        assert_eq!(victim.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_receiver_unsubscribes() {
        let emitter = Arc::new(ClosingEmitter::new());
        let victim = Victim::new();

        {
            let mut receiver = ClosingReceiver::new(Arc::clone(&emitter));
            receiver.activate(&victim);
        }

        emitter.close();
        assert_eq!(victim.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dead_subject_is_skipped() {
        let emitter = Arc::new(ClosingEmitter::new());
        let victim = Victim::new();

        // Keep the receiver alive but drop the subject.
        let mut receiver = ClosingReceiver::new(Arc::clone(&emitter));
        receiver.activate(&victim);
        drop(victim);

        emitter.close();
        // Nothing to assert on the victim; just must not crash, and the
        // receiver can still be dropped afterwards.
        drop(receiver);
    }

    #[test]
    fn cascade_hits_every_subscriber_once() {
        let emitter = Arc::new(ClosingEmitter::new());
        let victims: Vec<_> = (0..4).map(|_| Victim::new()).collect();
        let mut receivers: Vec<_> = victims
            .iter()
            .map(|v| {
                let mut r = ClosingReceiver::new(Arc::clone(&emitter));
                r.activate(v);
                r
            })
            .collect();

        emitter.close();
        for v in &victims {
            assert_eq!(v.closes.load(Ordering::SeqCst), 1);
        }
        receivers.clear();
    }
}
