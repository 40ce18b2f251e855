//! In-process bus hub.
//!
//! Every registered handler sees every matching message, whoever registered
//! it. Used to embed a worker in the same process and as the test transport.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use lantern_protocol::{Element, Pattern};
use tracing::{debug, warn};

use super::{dispatch, Handler, MessageBus};

struct Delivery {
    message: Element,
    reply: Option<Sender<Option<Element>>>,
}

struct LocalInner {
    handlers: RwLock<Vec<(Pattern, Handler)>>,
    queue: Mutex<Option<Sender<Delivery>>>,
}

/// Cheap to clone; all clones share one dispatch thread.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<LocalInner>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::new(LocalInner {
            handlers: RwLock::new(Vec::new()),
            queue: Mutex::new(Some(tx)),
        });

        let dispatch_inner = Arc::downgrade(&inner);
        let spawned = thread::Builder::new()
            .name("lantern-bus-dispatch".to_string())
            .spawn(move || run_dispatch(rx, dispatch_inner));
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn local bus dispatch thread");
        }

        Self { inner }
    }

    /// Stops the dispatch thread. Later sends are dropped and synchronous
    /// sends return `None` immediately.
    pub fn shutdown(&self) {
        let mut queue = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
        queue.take();
    }

    fn enqueue(&self, delivery: Delivery) -> bool {
        let queue = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
        match queue.as_ref() {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for LocalBus {
    fn send(&self, message: Element) {
        if !self.enqueue(Delivery {
            message,
            reply: None,
        }) {
            debug!("Local bus closed; dropping message");
        }
    }

    fn send_with_timeout(&self, message: Element, timeout: Duration) -> Option<Element> {
        let (tx, rx) = mpsc::channel();
        if !self.enqueue(Delivery {
            message,
            reply: Some(tx),
        }) {
            return None;
        }
        // The dispatcher drops the sender without a value when every handler
        // replied null, which surfaces here as a disconnect.
        rx.recv_timeout(timeout).ok().flatten()
    }

    fn register_pattern(&self, pattern: Pattern, handler: Handler) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner());
        handlers.push((pattern, handler));
    }
}

fn run_dispatch(rx: Receiver<Delivery>, inner: std::sync::Weak<LocalInner>) {
    for delivery in rx {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let handlers = inner
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        drop(inner);

        let reply = dispatch(&handlers, &delivery.message);
        if let (Some(tx), Some(reply)) = (delivery.reply, reply) {
            let _ = tx.send(Some(reply));
        }
    }
    debug!("Local bus dispatch thread exiting");
}
