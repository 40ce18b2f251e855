//! Launches a worker process and probes it until it answers a ping.
//!
//! A supervisor starts its worker at most once. Callers racing into
//! [`ProcessSupervisor::ensure_running`] while a start is in progress wait for
//! it and share the outcome; a failed start is remembered and returned to
//! every later caller without another launch.

use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use lantern_protocol::ping;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::error::StartupFailure;

/// How to launch one worker and how to reach it on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Used in logs and failure messages.
    pub name: String,
    /// Tag of the `PING` probe (`DIAD` for the analysis worker, `LIMBA` for
    /// the model server).
    pub ping_tag: String,
    /// Program followed by its arguments.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub max_attempts: u32,
    pub ping_timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            max_attempts: 500,
            ping_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Running {
    /// The worker answered before anything was launched.
    AlreadyUp,
    /// This supervisor launched the worker; it answered on probe `attempts`.
    Started { attempts: u32 },
}

#[derive(Debug, Clone)]
enum StartState {
    Idle,
    Starting,
    Running,
    Failed(StartupFailure),
}

pub struct ProcessSupervisor {
    spec: WorkerSpec,
    settings: ProbeSettings,
    bus: Arc<dyn MessageBus>,
    state: Mutex<StartState>,
    changed: Condvar,
    child: Mutex<Option<Child>>,
    spawns: AtomicUsize,
}

impl ProcessSupervisor {
    pub fn new(spec: WorkerSpec, settings: ProbeSettings, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            spec,
            settings,
            bus,
            state: Mutex::new(StartState::Idle),
            changed: Condvar::new(),
            child: Mutex::new(None),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn ensure_running(&self) -> Result<Running, StartupFailure> {
        let mut state = self.lock_state();
        loop {
            match &*state {
                StartState::Running => return Ok(Running::AlreadyUp),
                StartState::Failed(failure) => return Err(failure.clone()),
                StartState::Starting => {
                    state = self
                        .changed
                        .wait_while(state, |s| matches!(s, StartState::Starting))
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                StartState::Idle => break,
            }
        }
        *state = StartState::Starting;
        drop(state);

        let outcome = self.start();

        let mut state = self.lock_state();
        *state = match &outcome {
            Ok(_) => StartState::Running,
            Err(failure) => StartState::Failed(failure.clone()),
        };
        self.changed.notify_all();
        outcome
    }

    /// True once a probe has been answered. Never reverts.
    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), StartState::Running)
    }

    /// The recorded startup failure, if the start was attempted and failed.
    pub fn failure(&self) -> Option<StartupFailure> {
        match &*self.lock_state() {
            StartState::Failed(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    /// One liveness probe; any non-null reply counts as alive.
    pub fn ping(&self) -> bool {
        self.bus
            .send_with_timeout(ping(&self.spec.ping_tag), self.settings.ping_timeout)
            .is_some()
    }

    /// How many processes this supervisor has launched.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Kills and reaps the child this supervisor launched, if any.
    pub fn terminate(&self) {
        let Some(mut child) = self.lock_child().take() else {
            return;
        };
        if let Err(err) = child.kill() {
            debug!(worker = %self.spec.name, error = %err, "Worker already gone");
        }
        match child.wait() {
            Ok(status) => info!(worker = %self.spec.name, status = %status, "Worker terminated"),
            Err(err) => warn!(worker = %self.spec.name, error = %err, "Failed to reap worker"),
        }
    }

    fn start(&self) -> Result<Running, StartupFailure> {
        if self.ping() {
            info!(worker = %self.spec.name, "Worker already answering; not launching");
            return Ok(Running::AlreadyUp);
        }

        let max_attempts = self.settings.max_attempts;
        for attempt in 0..max_attempts {
            if attempt == 0 {
                self.spawn()?;
            } else if let Some(status) = self.exit_status() {
                warn!(worker = %self.spec.name, ?status, "Worker exited during startup");
                return Err(StartupFailure::ExitedEarly {
                    worker: self.spec.name.clone(),
                    status,
                });
            }

            if self.ping() {
                info!(worker = %self.spec.name, attempts = attempt + 1, "Worker is up");
                return Ok(Running::Started {
                    attempts: attempt + 1,
                });
            }

            if attempt + 1 < max_attempts {
                thread::sleep(self.settings.retry_delay);
            }
        }

        warn!(worker = %self.spec.name, attempts = max_attempts, "Worker never answered");
        Err(StartupFailure::BudgetExhausted {
            worker: self.spec.name.clone(),
            attempts: max_attempts,
        })
    }

    fn spawn(&self) -> Result<(), StartupFailure> {
        let spawn_failed = |details: String| StartupFailure::SpawnFailed {
            worker: self.spec.name.clone(),
            details,
        };

        let (program, args) = self
            .spec
            .args
            .split_first()
            .ok_or_else(|| spawn_failed("empty command line".to_string()))?;

        info!(worker = %self.spec.name, command = %self.spec.args.join(" "), "Launching worker");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| spawn_failed(err.to_string()))?;

        self.spawns.fetch_add(1, Ordering::SeqCst);
        debug!(worker = %self.spec.name, pid = child.id(), "Worker spawned");
        *self.lock_child() = Some(child);
        Ok(())
    }

    /// `Some(code)` once the launched child has exited. `None` while it runs
    /// or when this supervisor launched nothing.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        let mut child = self.lock_child();
        let child = child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(err) => {
                warn!(worker = %self.spec.name, error = %err, "Failed to poll worker");
                None
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StartState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
