//! Message bus contract between the assistant and its workers.
//!
//! The transport is owned by the host environment; the core only relies on
//! this trait. Two transports ship with the crate: [`LocalBus`] (in-process
//! hub) and [`SocketBus`] (client of a bus hub on a Unix socket).
//!
//! Handlers run on a bus-owned dispatch thread. A handler must never call
//! [`MessageBus::send_with_timeout`] itself: the reply it waits for would be
//! queued behind the handler that is waiting.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use lantern_protocol::{Element, Pattern};

mod local;
mod socket;

pub use local::LocalBus;
pub use socket::SocketBus;

/// Pattern handler: receives the message and the pattern's captures, returns
/// the reply owed to the sender (`None` for a null reply).
pub type Handler = Arc<dyn Fn(&Element, &[String]) -> Option<Element> + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Element, &[String]) -> Option<Element> + Send + Sync + 'static,
{
    Arc::new(f)
}

pub trait MessageBus: Send + Sync {
    /// Fire-and-forget delivery.
    fn send(&self, message: Element);

    /// Delivers `message` and blocks until the first non-null reply, or
    /// returns `None` once `timeout` elapses.
    fn send_with_timeout(&self, message: Element, timeout: Duration) -> Option<Element>;

    fn register_pattern(&self, pattern: Pattern, handler: Handler);
}

/// Offers `message` to every matching handler and returns the first non-null
/// reply. A panicking handler is logged and treated as a null reply so the
/// dispatch thread keeps serving.
pub(crate) fn dispatch(handlers: &[(Pattern, Handler)], message: &Element) -> Option<Element> {
    let mut reply = None;
    let mut matched = false;

    for (pattern, handler) in handlers {
        let Some(captures) = pattern.matches(message) else {
            continue;
        };
        matched = true;

        match catch_unwind(AssertUnwindSafe(|| handler(message, &captures))) {
            Ok(Some(answer)) if reply.is_none() => reply = Some(answer),
            Ok(_) => {}
            Err(_) => {
                tracing::error!(tag = %message.tag, "Bus handler panicked; replying null");
            }
        }
    }

    if !matched {
        tracing::trace!(tag = %message.tag, "No handler matched bus message");
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_returns_first_non_null_reply_and_runs_every_handler() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let null_calls = Arc::clone(&calls);
        let first_calls = Arc::clone(&calls);
        let second_calls = Arc::clone(&calls);

        let handlers: Vec<(Pattern, Handler)> = vec![
            (
                Pattern::new("DIAD"),
                handler(move |_, _| {
                    null_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    None
                }),
            ),
            (
                Pattern::new("DIAD"),
                handler(move |_, _| {
                    first_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Some(Element::new("FIRST"))
                }),
            ),
            (
                Pattern::new("DIAD"),
                handler(move |_, _| {
                    second_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Some(Element::new("SECOND"))
                }),
            ),
        ];

        let reply = dispatch(&handlers, &Element::new("DIAD"));
        assert_eq!(reply, Some(Element::new("FIRST")));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn dispatch_survives_panicking_handler() {
        let handlers: Vec<(Pattern, Handler)> = vec![
            (
                Pattern::new("DIAD"),
                handler(|_, _| -> Option<Element> {
                    panic!("malformed payload")
                }),
            ),
            (
                Pattern::new("DIAD"),
                handler(|_, _| Some(Element::new("OK"))),
            ),
        ];

        let reply = dispatch(&handlers, &Element::new("DIAD"));
        assert_eq!(reply, Some(Element::new("OK")));
    }
}
