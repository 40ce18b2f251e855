//! Client for a bus hub listening on a Unix socket.
//!
//! Frames are newline-delimited JSON [`BusFrame`]s. One reader thread per
//! connection routes replies to waiting senders by `reply_to`; every other
//! frame goes to a dispatch thread that runs the pattern handlers and writes
//! the reply frame back, so a handler may block without stalling replies.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use lantern_protocol::{parse_frame, BusFrame, Element, Pattern, MAX_FRAME_BYTES};
use tracing::{debug, info, warn};

use super::{dispatch, Handler, MessageBus};

const WRITE_TIMEOUT_MS: u64 = 2000;

struct Connection {
    stream: UnixStream,
    generation: u64,
}

struct SocketShared {
    handlers: RwLock<Vec<(Pattern, Handler)>>,
    waiters: Mutex<HashMap<u64, Sender<Option<Element>>>>,
    connection: Mutex<Option<Connection>>,
    next_seq: AtomicU64,
    next_generation: AtomicU64,
}

pub struct SocketBus {
    path: PathBuf,
    shared: Arc<SocketShared>,
}

impl SocketBus {
    /// Creates the client; the connection is opened on first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shared: Arc::new(SocketShared {
                handlers: RwLock::new(Vec::new()),
                waiters: Mutex::new(HashMap::new()),
                connection: Mutex::new(None),
                next_seq: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.connection).is_some()
    }

    /// Opens the connection now instead of on first send.
    pub fn connect(&self) -> Result<(), String> {
        let mut connection = lock(&self.shared.connection);
        self.ensure_connected(&mut connection)
    }

    fn ensure_connected(&self, connection: &mut Option<Connection>) -> Result<(), String> {
        if connection.is_some() {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.path)
            .map_err(|err| format!("Failed to connect to bus socket: {}", err))?;
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        let reader = stream
            .try_clone()
            .map_err(|err| format!("Failed to clone bus socket: {}", err))?;
        let generation = self.shared.next_generation.fetch_add(1, Ordering::SeqCst);

        let (inbound_tx, inbound_rx) = mpsc::channel();
        let reader_shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("lantern-bus-reader".to_string())
            .spawn(move || run_reader(reader, generation, reader_shared, inbound_tx))
            .map_err(|err| format!("Failed to spawn bus reader: {}", err))?;

        let dispatch_shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("lantern-bus-dispatch".to_string())
            .spawn(move || run_dispatch(inbound_rx, generation, dispatch_shared))
            .map_err(|err| format!("Failed to spawn bus dispatcher: {}", err))?;

        info!(path = %self.path.display(), generation, "Connected to bus");
        *connection = Some(Connection { stream, generation });
        Ok(())
    }

    fn write(&self, frame: &BusFrame) -> Result<(), String> {
        let mut connection = lock(&self.shared.connection);
        self.ensure_connected(&mut connection)?;
        let result = match connection.as_mut() {
            Some(conn) => write_frame(&mut conn.stream, frame),
            None => Err("Bus connection unavailable".to_string()),
        };
        if result.is_err() {
            close(&mut connection, &self.shared);
        }
        result
    }

    fn next_seq(&self) -> u64 {
        self.shared.next_seq.fetch_add(1, Ordering::SeqCst)
    }
}

impl MessageBus for SocketBus {
    fn send(&self, message: Element) {
        let frame = BusFrame::message(self.next_seq(), message);
        if let Err(err) = self.write(&frame) {
            warn!(error = %err, "Failed to send bus message");
        }
    }

    fn send_with_timeout(&self, message: Element, timeout: Duration) -> Option<Element> {
        let seq = self.next_seq();
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.waiters).insert(seq, tx);

        if let Err(err) = self.write(&BusFrame::message(seq, message)) {
            lock(&self.shared.waiters).remove(&seq);
            debug!(error = %err, "Synchronous bus send failed");
            return None;
        }

        let reply = rx.recv_timeout(timeout).ok().flatten();
        lock(&self.shared.waiters).remove(&seq);
        reply
    }

    fn register_pattern(&self, pattern: Pattern, handler: Handler) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((pattern, handler));
    }
}

impl Drop for SocketBus {
    fn drop(&mut self) {
        if let Some(conn) = lock(&self.shared.connection).take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

fn run_reader(
    stream: UnixStream,
    generation: u64,
    shared: Arc<SocketShared>,
    inbound: Sender<(u64, Element)>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();

    loop {
        line.clear();
        match (&mut reader)
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
        {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "Bus read failed");
                break;
            }
        }
        if line.len() > MAX_FRAME_BYTES && line.last() != Some(&b'\n') {
            warn!(
                generation,
                limit = MAX_FRAME_BYTES,
                "Bus frame exceeded maximum size; dropping connection"
            );
            break;
        }

        let trimmed = trim_newline(&line);
        if trimmed.is_empty() {
            continue;
        }
        let frame = match parse_frame(trimmed) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Dropping bad bus frame");
                continue;
            }
        };

        match (frame.reply_to, frame.message) {
            (Some(reply_to), Some(message)) => {
                // First non-null reply wins; later replies find no waiter.
                if let Some(tx) = lock(&shared.waiters).remove(&reply_to) {
                    let _ = tx.send(Some(message));
                }
            }
            (Some(_), None) => {}
            (None, Some(message)) => {
                if inbound.send((frame.seq, message)).is_err() {
                    break;
                }
            }
            (None, None) => {}
        }
    }

    let mut connection = lock(&shared.connection);
    if connection
        .as_ref()
        .is_some_and(|conn| conn.generation == generation)
    {
        close(&mut connection, &shared);
    }
    info!(generation, "Bus connection closed");
}

/// Shuts the socket down for every handle and wakes synchronous callers
/// with `None`. The reader of a closed connection sees EOF and exits.
fn close(connection: &mut Option<Connection>, shared: &SocketShared) {
    if let Some(conn) = connection.take() {
        let _ = conn.stream.shutdown(Shutdown::Both);
        debug!(generation = conn.generation, "Closed bus connection");
    }
    lock(&shared.waiters).clear();
}

fn run_dispatch(inbound: Receiver<(u64, Element)>, generation: u64, shared: Arc<SocketShared>) {
    for (seq, message) in inbound {
        let handlers = shared
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let reply = dispatch(&handlers, &message);

        let frame = BusFrame::reply(
            shared.next_seq.fetch_add(1, Ordering::SeqCst),
            seq,
            reply,
        );
        let mut connection = lock(&shared.connection);
        let failed = match connection.as_mut() {
            Some(conn) if conn.generation == generation => {
                write_frame(&mut conn.stream, &frame).is_err()
            }
            _ => {
                debug!(reply_to = seq, generation, "Connection replaced; dropping reply");
                continue;
            }
        };
        if failed {
            warn!(reply_to = seq, "Failed to write bus reply");
            close(&mut connection, &shared);
        }
    }
}

fn write_frame(stream: &mut UnixStream, frame: &BusFrame) -> Result<(), String> {
    let mut payload = serde_json::to_vec(frame)
        .map_err(|err| format!("Failed to serialize bus frame: {}", err))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err("Bus frame exceeded maximum size".to_string());
    }
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .map_err(|err| format!("Failed to write bus frame: {}", err))?;
    stream.flush().ok();
    Ok(())
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
