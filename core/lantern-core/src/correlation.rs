//! Pending deferred replies, keyed by correlation token.
//!
//! Every entry leaves the table exactly once: on its matching reply, when its
//! deadline is swept, on explicit cancellation, or when the table is drained.
//! The entry is removed under the lock and its callback runs after the lock
//! is released, so a callback may issue further commands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use lantern_protocol::Element;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::CommandError;

/// What a command callback eventually receives. `Ok(None)` means the worker
/// replied without a result body.
pub type CommandOutcome = std::result::Result<Option<Element>, CommandError>;

pub type ReplyCallback = Box<dyn FnOnce(CommandOutcome) + Send>;

/// Callback for commands nobody waits on.
pub fn dummy_callback() -> ReplyCallback {
    Box::new(|_| {})
}

struct PendingReply {
    verb: String,
    deadline: Instant,
    callback: ReplyCallback,
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<String, PendingReply>>,
    counter: AtomicU64,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `DIAD_<counter>_<random hex>`. The counter alone keeps tokens unique
    /// for the life of the table; the random part keeps them unique across
    /// restarts sharing a bus.
    pub fn next_token(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let salt: u64 = rand::thread_rng().gen();
        format!("DIAD_{}_{:016x}", counter, salt)
    }

    /// Returns false (and drops `callback` uninvoked) if `token` is already
    /// pending.
    pub fn register(
        &self,
        token: &str,
        verb: &str,
        deadline: Instant,
        callback: ReplyCallback,
    ) -> bool {
        let mut pending = self.lock();
        if pending.contains_key(token) {
            warn!(token, verb, "Refusing duplicate correlation token");
            return false;
        }
        pending.insert(
            token.to_string(),
            PendingReply {
                verb: verb.to_string(),
                deadline,
                callback,
            },
        );
        true
    }

    /// Delivers a reply. Returns false when nothing was waiting on `token`:
    /// a late reply after a sweep, a duplicate, or a token we never issued.
    pub fn resolve(&self, token: &str, result: Option<Element>) -> bool {
        let entry = self.lock().remove(token);
        match entry {
            Some(entry) => {
                debug!(token, verb = %entry.verb, "Resolved deferred reply");
                (entry.callback)(Ok(result));
                true
            }
            None => {
                warn!(token, "Correlation mismatch: no pending request for reply");
                false
            }
        }
    }

    pub fn cancel(&self, token: &str) -> bool {
        let entry = self.lock().remove(token);
        match entry {
            Some(entry) => {
                (entry.callback)(Err(CommandError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fails every entry whose deadline is at or before `now` with
    /// [`CommandError::Timeout`]. Returns how many expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<(String, PendingReply)> = {
            let mut pending = self.lock();
            let tokens: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| pending.remove(&token).map(|entry| (token, entry)))
                .collect()
        };

        let count = expired.len();
        for (token, entry) in expired {
            warn!(token = %token, verb = %entry.verb, "Deferred reply timed out");
            (entry.callback)(Err(CommandError::Timeout));
        }
        count
    }

    /// Teardown: fails everything still pending with
    /// [`CommandError::Cancelled`].
    pub fn drain(&self) -> usize {
        let drained: Vec<PendingReply> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            (entry.callback)(Err(CommandError::Cancelled));
        }
        if count > 0 {
            debug!(count, "Cancelled pending replies on teardown");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.lock().contains_key(token)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingReply>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(300)
    }

    fn recording() -> (ReplyCallback, mpsc::Receiver<CommandOutcome>) {
        let (tx, rx) = mpsc::channel();
        let callback: ReplyCallback = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (callback, rx)
    }

    #[test]
    fn tokens_are_unique_and_prefixed() {
        let table = CorrelationTable::new();
        let tokens: HashSet<String> = (0..1000).map(|_| table.next_token()).collect();
        assert_eq!(tokens.len(), 1000);
        assert!(tokens.iter().all(|token| token.starts_with("DIAD_")));
    }

    #[test]
    fn resolve_invokes_callback_with_result() {
        let table = CorrelationTable::new();
        let (callback, rx) = recording();
        assert!(table.register("DIAD_1_a", "EXPLAIN", far_deadline(), callback));

        let result = Element::new("RESULT").with_attr("RESPONSE", "root cause is X");
        assert!(table.resolve("DIAD_1_a", Some(result.clone())));

        assert_eq!(rx.recv().expect("outcome"), Ok(Some(result)));
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_token_is_a_mismatch() {
        let table = CorrelationTable::new();
        assert!(!table.resolve("DIAD_9_ffff", None));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let table = CorrelationTable::new();
        assert!(table.register("T", "QUERY", far_deadline(), dummy_callback()));
        assert!(!table.register("T", "QUERY", far_deadline(), dummy_callback()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_resolves_fire_callback_once() {
        let table = Arc::new(CorrelationTable::new());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        table.register(
            "DIAD_1_b",
            "QUERY",
            far_deadline(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.resolve("DIAD_1_b", None))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_times_out_only_expired_entries() {
        let table = CorrelationTable::new();
        let now = Instant::now();
        let (expired, expired_rx) = recording();
        let (live, live_rx) = recording();
        table.register("old", "EXPLAIN", now, expired);
        table.register("new", "EXPLAIN", now + Duration::from_secs(60), live);

        assert_eq!(table.sweep_expired(now), 1);
        assert_eq!(
            expired_rx.recv().expect("outcome"),
            Err(CommandError::Timeout)
        );
        assert!(live_rx.try_recv().is_err());
        assert!(table.contains("new"));

        // A reply arriving after the sweep finds nothing.
        assert!(!table.resolve("old", None));
    }

    #[test]
    fn cancel_and_drain_deliver_cancelled() {
        let table = CorrelationTable::new();
        let (first, first_rx) = recording();
        let (second, second_rx) = recording();
        table.register("a", "QUERY", far_deadline(), first);
        table.register("b", "QUERY", far_deadline(), second);

        assert!(table.cancel("a"));
        assert!(!table.cancel("a"));
        assert_eq!(table.drain(), 1);

        assert_eq!(first_rx.recv().expect("a"), Err(CommandError::Cancelled));
        assert_eq!(second_rx.recv().expect("b"), Err(CommandError::Cancelled));
        assert!(table.is_empty());
    }

    #[test]
    fn callback_may_reenter_table() {
        let table = Arc::new(CorrelationTable::new());
        let inner = Arc::clone(&table);
        table.register(
            "outer",
            "QUERY",
            far_deadline(),
            Box::new(move |_| {
                inner.register("follow_up", "EXPLAIN", far_deadline(), dummy_callback());
            }),
        );

        assert!(table.resolve("outer", None));
        assert!(table.contains("follow_up"));
    }
}
