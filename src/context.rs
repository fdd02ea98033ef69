// src/context.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::ChannelFactory;
use crate::closing::ClosingEmitter;
use crate::transport::Transport;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn context_id() -> String {
    format!(
        "{}:c{}",
        std::process::id(),
        CONTEXT_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Process-wide owner of transports and channel factories, and the
/// root of the close cascade.
///
/// The registry is explicit: transports and channel factories are
/// handed to the context by name, there is no implicit process-global
/// list. `close` is idempotent and fans out through the closing
/// emitter and then through every registered factory; `join` closes
/// and then waits for all background threads.
pub struct Context {
    id: String,
    emitter: Arc<ClosingEmitter>,
    registry: Mutex<Registry>,
    closed: AtomicBool,
    joined: AtomicBool,
}

#[derive(Default)]
struct Registry {
    transports: HashMap<String, Arc<dyn Transport>>,
    channels: HashMap<String, Arc<dyn ChannelFactory>>,
}

impl Context {
    pub fn new() -> Arc<Self> {
        let id = context_id();
        tracing::debug!(context = %id, "context created");
        Arc::new(Context {
            id,
            emitter: Arc::new(ClosingEmitter::new()),
            registry: Mutex::new(Registry::default()),
            closed: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        })
    }

    /// Register a transport flavor under a name. Names must be unique.
    pub fn register_transport(&self, name: &str, transport: Arc<dyn Transport>) {
        assert!(!name.is_empty(), "transport name must not be empty");
        let mut registry = self.registry.lock();
        let previous = registry.transports.insert(name.to_string(), transport);
        assert!(
            previous.is_none(),
            "transport {name:?} is already registered"
        );
    }

    /// Register a channel factory under a name. Names must be unique.
    pub fn register_channel(&self, name: &str, factory: Arc<dyn ChannelFactory>) {
        assert!(!name.is_empty(), "channel name must not be empty");
        let mut registry = self.registry.lock();
        let previous = registry.channels.insert(name.to_string(), factory);
        assert!(previous.is_none(), "channel {name:?} is already registered");
    }

    pub fn transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.registry.lock().transports.get(name).cloned()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn ChannelFactory>> {
        self.registry.lock().channels.get(name).cloned()
    }

    /// The emitter subordinate objects subscribe to.
    pub fn closing_emitter(&self) -> &Arc<ClosingEmitter> {
        &self.emitter
    }

    /// Close everything this context owns. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(context = %self.id, "context closing");
            self.emitter.close();

            let (transports, channels) = {
                let registry = self.registry.lock();
                (
                    registry.transports.values().cloned().collect::<Vec<_>>(),
                    registry.channels.values().cloned().collect::<Vec<_>>(),
                )
            };
            for transport in transports {
                transport.close();
            }
            for factory in channels {
                factory.close();
            }
        }
    }

    /// Close, then wait for every worker thread to exit.
    pub fn join(&self) {
        self.close();
        if !self.joined.swap(true, Ordering::SeqCst) {
            let (transports, channels) = {
                let registry = self.registry.lock();
                (
                    registry.transports.values().cloned().collect::<Vec<_>>(),
                    registry.channels.values().cloned().collect::<Vec<_>>(),
                )
            };
            for transport in transports {
                transport.join();
            }
            for factory in channels {
                factory.join();
            }
            tracing::debug!(context = %self.id, "context joined");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::basic::BasicChannelFactory;
    use crate::transport::sock::SockTransport;

    #[test]
    fn registry_lookup() {
        let context = Context::new();
        let transport = SockTransport::new().unwrap();
        let factory = BasicChannelFactory::new();

        context.register_transport("sock", transport);
        context.register_channel("basic", factory);

        assert!(context.transport("sock").is_some());
        assert!(context.transport("shm").is_none());
        assert!(context.channel("basic").is_some());
        assert!(context.channel("cma").is_none());

        context.join();
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_transport_name_panics() {
        let context = Context::new();
        let transport = SockTransport::new().unwrap();
        context.register_transport("sock", transport.clone() as Arc<dyn Transport>);
        // Make sure the loop thread is not leaked by the panic below.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            context.register_transport("sock", transport.clone() as Arc<dyn Transport>);
        }));
        transport.join();
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    fn close_then_join_is_idempotent() {
        let context = Context::new();
        context.register_transport("sock", SockTransport::new().unwrap());
        context.close();
        context.close();
        context.join();
        context.join();
    }
}
