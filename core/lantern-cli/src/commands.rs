//! Subcommand implementations. Each returns the process exit code.

use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lantern_core::{
    load_config, CommandKind, Destination, Engine, LanternConfig, MessageBus, Session, SocketBus,
    WorkerSpec,
};
use lantern_protocol::{ping as ping_message, COMMAND_TAG, MODEL_TAG};
use tracing::{info, warn};

const READY_POLL: Duration = Duration::from_millis(100);
const WORKER_POLL: Duration = Duration::from_secs(1);

/// Logs every session change; claims every session.
struct LogDestination;

impl Destination for LogDestination {
    fn on_instance_added(&self, session: &Session) {
        info!(
            id = %session.id,
            title = %session.title(),
            phase = %session.phase(),
            "Session added"
        );
    }

    fn on_instance_updated(&self, session: &Session) {
        info!(
            id = %session.id,
            phase = %session.phase(),
            location = %session.location_string(),
            symptom = %session.symptom_string(),
            doing_query = session.doing_query,
            "Session updated"
        );
    }

    fn on_instance_removed(&self, session: &Session) {
        info!(id = %session.id, phase = %session.phase(), "Session finished");
    }

    fn is_id_relevant(&self, _id: &str) -> bool {
        true
    }
}

/// Workers are separate processes, so the CLI always talks to them through
/// a bus hub socket.
fn open_bus(config: &LanternConfig) -> Result<Arc<dyn MessageBus>, String> {
    let path = config
        .bus
        .socket
        .as_ref()
        .ok_or_else(|| "bus.socket is not configured".to_string())?;
    info!(path = %path.display(), "Using bus hub socket");
    Ok(Arc::new(SocketBus::new(path)))
}

fn open_engine(config: LanternConfig) -> Result<Arc<Engine>, String> {
    let bus = open_bus(&config)?;
    let engine = Arc::new(Engine::new(config, bus)?);
    engine.register_destination(Arc::new(LogDestination));
    Ok(engine)
}

/// Cancels pending requests and kills any worker this process launched.
fn stop_workers(engine: &Engine) {
    engine.shutdown();
    if let Some(secondary) = engine.secondary() {
        secondary.terminate();
    }
    engine.primary().terminate();
}

pub fn watch(config_path: Option<PathBuf>, terminate_on_failure: bool) -> Result<i32, String> {
    let engine = open_engine(load_config(config_path)?)?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|err| format!("Failed to install interrupt handler: {}", err))?;

    let starter = engine.start_in_background()?;
    if starter.join().is_err() {
        return Err("starter thread panicked".to_string());
    }
    if let Some(failure) = engine.primary().failure() {
        if terminate_on_failure {
            engine.primary().terminate();
        }
        return Err(failure.to_string());
    }

    info!("Workers running; watching sessions until interrupted");
    let code = loop {
        match stop_rx.recv_timeout(WORKER_POLL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("Interrupted; stopping workers");
                break 0;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Some(status) = engine.primary().exit_status() {
                    warn!(?status, "Analysis worker exited");
                    break 1;
                }
            }
        }
    };

    stop_workers(&engine);
    Ok(code)
}

pub fn ping(config_path: Option<PathBuf>, model: bool) -> Result<i32, String> {
    let config = load_config(config_path)?;
    let bus = open_bus(&config)?;
    let tag = if model { MODEL_TAG } else { COMMAND_TAG };
    let timeout = config.timeouts.probe_settings().ping_timeout;

    match bus.send_with_timeout(ping_message(tag), timeout) {
        Some(_) => {
            println!("{} is alive", tag);
            Ok(0)
        }
        None => {
            println!("{} did not answer within {:?}", tag, timeout);
            Ok(1)
        }
    }
}

pub fn args(config_path: Option<PathBuf>, json: bool) -> Result<i32, String> {
    let config = load_config(config_path)?;
    let mut specs = vec![config.primary_spec()?];
    specs.extend(config.secondary_spec()?);

    for spec in &specs {
        println!("{}", render_spec(spec, json)?);
    }
    Ok(0)
}

fn render_spec(spec: &WorkerSpec, json: bool) -> Result<String, String> {
    if json {
        serde_json::to_string(&spec.args)
            .map_err(|err| format!("Failed to serialize arguments: {}", err))
    } else {
        Ok(format!("{}: {}", spec.name, spec.args.join(" ")))
    }
}

pub fn ask(
    config_path: Option<PathBuf>,
    session_id: &str,
    command: &str,
    text: Option<String>,
    wait_secs: u64,
) -> Result<i32, String> {
    let kind = CommandKind::parse(command).ok_or_else(|| format!("Unknown command: {}", command))?;
    if kind == CommandKind::Query && text.is_none() {
        return Err("QUERY needs question text".to_string());
    }

    let config = load_config(config_path)?;
    let reply_timeout = config.timeouts.command_timeout();
    let engine = open_engine(config)?;

    let result = ask_ready_session(&engine, session_id, kind, text, wait_secs, reply_timeout);
    stop_workers(&engine);
    result
}

fn ask_ready_session(
    engine: &Engine,
    session_id: &str,
    kind: CommandKind,
    text: Option<String>,
    wait_secs: u64,
    reply_timeout: Duration,
) -> Result<i32, String> {
    engine.start_workers().map_err(|failure| failure.to_string())?;

    if !wait_until_ready(engine, session_id, Duration::from_secs(wait_secs)) {
        println!("Session {} did not become ready", session_id);
        return Ok(1);
    }

    let (tx, rx) = mpsc::channel();
    engine
        .ask(session_id, kind, text, move |reply| {
            let _ = tx.send(reply);
        })
        .map_err(|err| err.to_string())?;

    match rx.recv_timeout(reply_timeout) {
        Ok(Ok(response)) => {
            println!("{}", response);
            Ok(0)
        }
        Ok(Err(err)) => {
            println!("{} failed: {}", kind.verb(), err);
            Ok(1)
        }
        Err(_) => {
            println!("{} got no reply within {:?}", kind.verb(), reply_timeout);
            Ok(1)
        }
    }
}

fn wait_until_ready(engine: &Engine, session_id: &str, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        let ready = engine
            .registry()
            .get(session_id)
            .is_some_and(|session| session.commands_enabled());
        if ready {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(READY_POLL);
    }
}
