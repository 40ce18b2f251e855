//! # lantern-core
//!
//! Session lifecycle and worker protocol core for the Lantern debugging
//! assistant.
//!
//! ## Design Principles
//!
//! - **Synchronous**: Plain OS threads and channels; no async runtime.
//! - **Thread-safe**: Every shared structure is behind a `Mutex` and recovers
//!   from lock poisoning instead of panicking.
//! - **Worker owns the state**: Sessions mirror whatever the analysis worker
//!   last asserted; the core never invents transitions.
//! - **Graceful degradation**: An unreachable worker means absent results,
//!   logged, never a panic.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lantern_core::{load_config, Engine, SocketBus};
//!
//! let config = load_config(None)?;
//! let bus = Arc::new(SocketBus::new("/tmp/lantern.sock"));
//! let engine = Arc::new(Engine::new(config, bus)?);
//! engine.start_in_background()?;
//! ```

pub mod bus;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use bus::{handler, Handler, LocalBus, MessageBus, SocketBus};
pub use config::{default_config_path, load_config, log_dir, LanternConfig};
pub use correlation::{dummy_callback, CommandOutcome, CorrelationTable, ReplyCallback};
pub use engine::{Engine, MISSING_RESPONSE};
pub use error::{CommandError, LanternError, Result, StartupFailure};
pub use registry::{Destination, DestinationId, SessionRegistry, UpdateOutcome};
pub use session::{CommandKind, Session, StatusColor};
pub use supervisor::{ProbeSettings, ProcessSupervisor, Running, WorkerSpec};
