//! Engine - the assistant's service object.
//!
//! One engine owns everything a client needs to talk to the workers:
//! - **Supervisors** for the analysis worker and the optional model server
//! - **Bus handlers** for worker pushes (`UPDATE`, `PING`) and deferred replies
//! - **Session registry** fed by those pushes
//! - **Correlation table** plus the sweeper thread that expires stale requests
//!
//! Construct it once and share it behind an `Arc`.
//!
//! ```rust,ignore
//! use lantern_core::{load_config, Engine, LocalBus};
//!
//! let config = load_config(None)?;
//! let engine = Arc::new(Engine::new(config, Arc::new(LocalBus::new()))?);
//! engine.start_in_background()?;
//! ```

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use lantern_protocol::{
    ack, command, pong, Element, Pattern, ATTR_REPLY_ID, ATTR_RESPONSE, ATTR_SESSION_ID, ATTR_VERB,
    REPLY_TAG, RESULT_TAG, VERB_PING, VERB_UPDATE,
};
use tracing::{debug, error, info, warn};

use crate::bus::{handler, MessageBus};
use crate::config::LanternConfig;
use crate::correlation::{dummy_callback, CommandOutcome, CorrelationTable, ReplyCallback};
use crate::error::{CommandError, LanternError, Result, StartupFailure};
use crate::registry::{Destination, DestinationId, SessionRegistry};
use crate::session::{CommandKind, Session};
use crate::supervisor::{ProcessSupervisor, WorkerSpec};

/// Shown when a reply carries no response text.
pub const MISSING_RESPONSE: &str = "???";

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Engine {
    config: LanternConfig,
    bus: Arc<dyn MessageBus>,
    primary: Arc<ProcessSupervisor>,
    secondary: Option<Arc<ProcessSupervisor>>,
    registry: Arc<SessionRegistry>,
    correlation: Arc<CorrelationTable>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Engine {
    /// Builds worker command lines from `config`.
    pub fn new(config: LanternConfig, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let primary = config.primary_spec()?;
        let secondary = config.secondary_spec()?;
        Self::with_workers(config, bus, primary, secondary)
    }

    /// Uses the given worker specs instead of deriving them from `config`.
    pub fn with_workers(
        config: LanternConfig,
        bus: Arc<dyn MessageBus>,
        primary: WorkerSpec,
        secondary: Option<WorkerSpec>,
    ) -> Result<Self> {
        let settings = config.probe_settings();
        let primary = Arc::new(ProcessSupervisor::new(primary, settings, Arc::clone(&bus)));
        let secondary = secondary
            .map(|spec| Arc::new(ProcessSupervisor::new(spec, settings, Arc::clone(&bus))));

        let registry = Arc::new(SessionRegistry::new());
        let correlation = Arc::new(CorrelationTable::new());
        register_handlers(bus.as_ref(), &registry, &correlation);
        let sweeper = spawn_sweeper(&config, &correlation)?;

        Ok(Self {
            config,
            bus,
            primary,
            secondary,
            registry,
            correlation,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────────────

    /// Brings up the analysis worker, then the model server if configured.
    /// Blocks for as long as the probe budget allows.
    pub fn start_workers(&self) -> std::result::Result<(), StartupFailure> {
        self.primary.ensure_running()?;
        if let Some(secondary) = &self.secondary {
            secondary.ensure_running()?;
        }
        Ok(())
    }

    /// Runs [`Engine::start_workers`] on a starter thread. Failures are
    /// logged; they stay recorded on the supervisors.
    pub fn start_in_background(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let engine = Arc::clone(self);
        thread::Builder::new()
            .name("lantern-starter".to_string())
            .spawn(move || {
                if let Err(failure) = engine.start_workers() {
                    error!(error = %failure, "Unable to start workers");
                }
            })
            .map_err(|source| LanternError::Io {
                context: "spawning starter thread".to_string(),
                source,
            })
    }

    pub fn is_running(&self) -> bool {
        self.primary.is_running()
    }

    pub fn primary(&self) -> &ProcessSupervisor {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&ProcessSupervisor> {
        self.secondary.as_deref()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Commands
    // ─────────────────────────────────────────────────────────────────────────────

    /// Synchronous round-trip to the analysis worker. `None` when the worker
    /// is not running or does not answer within the command timeout.
    pub fn send_message(
        &self,
        verb: &str,
        args: &[(&str, String)],
        body: Option<Element>,
    ) -> Option<Element> {
        if !self.primary.is_running() {
            debug!(verb, "Worker not running; skipping send");
            return None;
        }
        self.bus.send_with_timeout(
            command(verb, args, body),
            self.config.timeouts.command_timeout(),
        )
    }

    /// Sends a command whose answer arrives later as a deferred reply.
    /// Returns the correlation token. Without a callback the reply is
    /// dropped when it arrives.
    pub fn issue_command(
        &self,
        verb: &str,
        args: &[(&str, String)],
        body: Option<Element>,
        callback: Option<ReplyCallback>,
    ) -> std::result::Result<String, CommandError> {
        if !self.primary.is_running() {
            return Err(CommandError::Unavailable);
        }

        let token = self.correlation.next_token();
        let deadline = Instant::now() + self.config.timeouts.request_deadline();
        let callback = callback.unwrap_or_else(dummy_callback);
        if !self.correlation.register(&token, verb, deadline, callback) {
            return Err(CommandError::Busy(token));
        }

        let mut full_args: Vec<(&str, String)> = vec![(ATTR_REPLY_ID, token.clone())];
        full_args.extend(args.iter().cloned());
        debug!(verb, token = %token, "Issuing command");
        self.bus.send(command(verb, &full_args, body));
        Ok(token)
    }

    /// Runs a user command against a ready session. `on_reply` receives the
    /// response text (`"???"` when the worker sent none) or the failure; the
    /// session's `doing_query` flag is cleared right after it returns, or
    /// unwinds.
    pub fn ask<F>(
        &self,
        session_id: &str,
        kind: CommandKind,
        text: Option<String>,
        on_reply: F,
    ) -> std::result::Result<String, CommandError>
    where
        F: FnOnce(std::result::Result<String, CommandError>) + Send + 'static,
    {
        self.registry.begin_query(session_id)?;

        let body = match kind {
            CommandKind::Query => Some(Element::new("QUERY").with_text(text.unwrap_or_default())),
            _ => None,
        };

        let guard = QueryGuard {
            registry: Arc::clone(&self.registry),
            id: session_id.to_string(),
        };
        let callback: ReplyCallback = Box::new(move |outcome: CommandOutcome| {
            let _guard = guard;
            on_reply(outcome.map(|result| response_text(result.as_ref())));
        });

        // A refused command drops the callback, and with it the guard.
        let args = [(ATTR_SESSION_ID, session_id.to_string())];
        self.issue_command(kind.verb(), &args, body, Some(callback))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.registry.sessions()
    }

    pub fn remove_instance(&self, id: &str) -> Option<Session> {
        self.registry.remove_instance(id)
    }

    pub fn register_destination(&self, destination: Arc<dyn Destination>) -> DestinationId {
        self.registry.register_destination(destination)
    }

    pub fn unregister_destination(&self, id: DestinationId) -> bool {
        self.registry.unregister_destination(id)
    }

    pub fn pending_requests(&self) -> usize {
        self.correlation.len()
    }

    pub fn config(&self) -> &LanternConfig {
        &self.config
    }

    /// Stops the sweeper and cancels every pending request. Idempotent.
    pub fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.stop.send(());
            if sweeper.handle.join().is_err() {
                warn!("Correlation sweeper panicked");
            }
        }
        self.correlation.drain();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears a session's `doing_query` flag when dropped, so a panicking reply
/// callback cannot leave the session's commands disabled.
struct QueryGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl Drop for QueryGuard {
    fn drop(&mut self) {
        self.registry.finish_query(&self.id);
    }
}

fn response_text(result: Option<&Element>) -> String {
    result
        .and_then(|result| result.attr(ATTR_RESPONSE))
        .unwrap_or(MISSING_RESPONSE)
        .to_string()
}

fn register_handlers(
    bus: &dyn MessageBus,
    registry: &Arc<SessionRegistry>,
    correlation: &Arc<CorrelationTable>,
) {
    let table = Arc::clone(correlation);
    bus.register_pattern(
        Pattern::new(REPLY_TAG).capture(ATTR_REPLY_ID),
        handler(move |message, captures| {
            let token = captures.first().map(String::as_str).unwrap_or_default();
            let result = message.child(RESULT_TAG).cloned();
            if result.is_none() {
                warn!(token, "Deferred reply carried no result");
            }
            table.resolve(token, result);
            None
        }),
    );

    let sessions = Arc::clone(registry);
    bus.register_pattern(
        Pattern::new(REPLY_TAG).capture(ATTR_VERB),
        handler(move |message, captures| {
            let verb = captures.first().map(String::as_str).unwrap_or_default();
            match verb {
                VERB_PING => Some(pong()),
                VERB_UPDATE => {
                    let outcome = sessions.apply_update(message);
                    debug!(?outcome, "Applied candidate update");
                    Some(ack())
                }
                other => {
                    error!(verb = other, "Unknown worker message");
                    None
                }
            }
        }),
    );
}

fn spawn_sweeper(config: &LanternConfig, correlation: &Arc<CorrelationTable>) -> Result<Sweeper> {
    let (stop, stop_rx) = mpsc::channel::<()>();
    let interval = config.timeouts.sweep_interval();
    let table = Arc::clone(correlation);

    let handle = thread::Builder::new()
        .name("lantern-sweeper".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let expired = table.sweep_expired(Instant::now());
                    if expired > 0 {
                        info!(expired, "Expired stale requests");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(|source| LanternError::Io {
            context: "spawning correlation sweeper".to_string(),
            source,
        })?;

    Ok(Sweeper { stop, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use lantern_protocol::{deferred_reply, ping, update, CANDIDATE_TAG, COMMAND_TAG, MODEL_TAG};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn worker_spec() -> WorkerSpec {
        WorkerSpec {
            name: "analysis".to_string(),
            ping_tag: COMMAND_TAG.to_string(),
            args: vec!["/nonexistent/diad".to_string()],
        }
    }

    fn quick_config() -> LanternConfig {
        let mut config = LanternConfig::default();
        config.timeouts.ping_ms = 200;
        config.timeouts.retry_delay_ms = 10;
        config.timeouts.max_attempts = 2;
        config.timeouts.command_ms = 500;
        config.timeouts.sweep_interval_ms = 20;
        config
    }

    fn engine_on(bus: &LocalBus, config: LanternConfig) -> Engine {
        Engine::with_workers(config, Arc::new(bus.clone()), worker_spec(), None).expect("engine")
    }

    fn model_spec() -> WorkerSpec {
        WorkerSpec {
            name: "model".to_string(),
            ping_tag: MODEL_TAG.to_string(),
            args: vec!["/nonexistent/limba".to_string()],
        }
    }

    /// Answers model-server pings and counts them.
    fn counting_model_server(bus: &LocalBus) -> Arc<AtomicUsize> {
        let pings = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&pings);
        bus.register_pattern(
            Pattern::new(MODEL_TAG).exact(ATTR_VERB, VERB_PING),
            handler(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Some(pong())
            }),
        );
        pings
    }

    fn push_ready(bus: &LocalBus, id: &str) {
        let candidate = Element::new(CANDIDATE_TAG)
            .with_attr(ATTR_SESSION_ID, id)
            .with_attr("STATE", "READY");
        assert_eq!(
            bus.send_with_timeout(update(candidate), Duration::from_secs(1)),
            Some(ack())
        );
    }

    fn answering_worker(bus: &LocalBus) {
        bus.register_pattern(
            Pattern::new(COMMAND_TAG).exact(ATTR_VERB, VERB_PING),
            handler(|_, _| Some(pong())),
        );
    }

    #[test]
    fn worker_ping_gets_pong() {
        let bus = LocalBus::new();
        let _engine = engine_on(&bus, quick_config());

        let reply = bus.send_with_timeout(ping(REPLY_TAG), Duration::from_secs(1));
        assert_eq!(reply, Some(pong()));
    }

    #[test]
    fn update_push_is_acked_and_applied() {
        let bus = LocalBus::new();
        let engine = engine_on(&bus, quick_config());

        let candidate = Element::new(CANDIDATE_TAG)
            .with_attr("ID", "C1")
            .with_attr("STATE", "READY");
        let reply = bus.send_with_timeout(update(candidate), Duration::from_secs(1));

        assert_eq!(reply, Some(ack()));
        assert_eq!(engine.sessions().len(), 1);
    }

    #[test]
    fn unknown_verb_gets_null_reply() {
        let bus = LocalBus::new();
        let _engine = engine_on(&bus, quick_config());

        let message = Element::new(REPLY_TAG).with_attr(ATTR_VERB, "REBOOT");
        assert_eq!(
            bus.send_with_timeout(message, Duration::from_millis(300)),
            None
        );
    }

    #[test]
    fn commands_short_circuit_until_worker_runs() {
        let bus = LocalBus::new();
        let engine = engine_on(&bus, quick_config());

        assert_eq!(engine.send_message("PING", &[], None), None);
        assert_eq!(
            engine.issue_command("EXPLAIN", &[], None, None),
            Err(CommandError::Unavailable)
        );
        assert_eq!(engine.pending_requests(), 0);
    }

    #[test]
    fn failed_start_keeps_commands_unavailable() {
        let bus = LocalBus::new();
        let engine = engine_on(&bus, quick_config());

        assert!(engine.start_workers().is_err());
        assert!(!engine.is_running());
        assert_eq!(
            engine.issue_command("EXPLAIN", &[], None, None),
            Err(CommandError::Unavailable)
        );
    }

    #[test]
    fn send_message_round_trips_once_running() {
        let bus = LocalBus::new();
        answering_worker(&bus);
        bus.register_pattern(
            Pattern::new(COMMAND_TAG).exact(ATTR_VERB, "VERSION"),
            handler(|_, _| Some(Element::new(RESULT_TAG).with_attr("VERSION", "2.1"))),
        );
        let engine = engine_on(&bus, quick_config());
        engine.start_workers().expect("worker answers");

        let reply = engine.send_message("VERSION", &[], None).expect("reply");
        assert_eq!(reply.attr("VERSION"), Some("2.1"));
    }

    #[test]
    fn sweeper_times_out_unanswered_commands() {
        let bus = LocalBus::new();
        answering_worker(&bus);
        let mut config = quick_config();
        config.timeouts.request_deadline_ms = 30;
        let engine = engine_on(&bus, config);
        engine.start_workers().expect("worker answers");

        let (tx, rx) = mpsc::channel();
        engine
            .issue_command(
                "EXPLAIN",
                &[],
                None,
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .expect("issued");

        let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("swept");
        assert_eq!(outcome, Err(CommandError::Timeout));
        assert_eq!(engine.pending_requests(), 0);
    }

    #[test]
    fn shutdown_cancels_pending_requests() {
        let bus = LocalBus::new();
        answering_worker(&bus);
        let engine = engine_on(&bus, quick_config());
        engine.start_workers().expect("worker answers");

        let (tx, rx) = mpsc::channel();
        engine
            .issue_command(
                "LOCATIONS",
                &[],
                None,
                Some(Box::new(move |outcome| {
                    let _ = tx.send(outcome);
                })),
            )
            .expect("issued");

        engine.shutdown();
        assert_eq!(rx.recv().expect("cancelled"), Err(CommandError::Cancelled));
        engine.shutdown();
    }

    #[test]
    fn secondary_is_not_started_when_primary_fails() {
        let bus = LocalBus::new();
        let model_pings = counting_model_server(&bus);
        let engine = Engine::with_workers(
            quick_config(),
            Arc::new(bus.clone()),
            worker_spec(),
            Some(model_spec()),
        )
        .expect("engine");

        assert!(engine.start_workers().is_err());

        let secondary = engine.secondary().expect("secondary configured");
        assert_eq!(model_pings.load(Ordering::SeqCst), 0);
        assert_eq!(secondary.spawn_count(), 0);
        assert!(!secondary.is_running());
        assert!(secondary.failure().is_none());
    }

    #[test]
    fn secondary_is_probed_once_primary_answers() {
        let bus = LocalBus::new();
        answering_worker(&bus);
        let model_pings = counting_model_server(&bus);
        let engine = Engine::with_workers(
            quick_config(),
            Arc::new(bus.clone()),
            worker_spec(),
            Some(model_spec()),
        )
        .expect("engine");

        engine.start_workers().expect("both workers answer");

        let secondary = engine.secondary().expect("secondary configured");
        assert!(model_pings.load(Ordering::SeqCst) >= 1);
        assert!(secondary.is_running());
        assert_eq!(secondary.spawn_count(), 0);
    }

    #[test]
    fn panicking_reply_callback_still_clears_query_flag() {
        let bus = LocalBus::new();
        answering_worker(&bus);
        let replies = bus.clone();
        bus.register_pattern(
            Pattern::new(COMMAND_TAG)
                .exact(ATTR_VERB, "EXPLAIN")
                .capture(ATTR_REPLY_ID),
            handler(move |_, captures| {
                let result = Element::new(RESULT_TAG).with_attr(ATTR_RESPONSE, "ok");
                replies.send(deferred_reply(&captures[0], Some(result)));
                Some(ack())
            }),
        );
        let engine = engine_on(&bus, quick_config());
        engine.start_workers().expect("worker answers");
        push_ready(&bus, "C1");

        engine
            .ask("C1", CommandKind::Explain, None, |_| {
                panic!("panel blew up");
            })
            .expect("command issued");

        let cleared = (0..100).any(|_| {
            let busy = engine
                .registry()
                .get("C1")
                .is_some_and(|session| session.doing_query);
            if busy {
                thread::sleep(Duration::from_millis(10));
            }
            !busy
        });
        assert!(cleared, "doing_query stuck after callback panic");
        assert!(engine
            .ask("C1", CommandKind::Explain, None, |_| {})
            .is_ok());
    }
}
