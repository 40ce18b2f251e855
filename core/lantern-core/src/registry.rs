//! Registry of live debugging sessions and the UI destinations watching them.
//!
//! `UPDATE` pushes from the worker land here. The registry decides whether a
//! snapshot creates, replaces, or retires a session and tells the relevant
//! destination. Notifications carry owned `Session` clones and are issued
//! after the registry lock is released, so a destination may call back in.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lantern_protocol::{CandidateSnapshot, Element};
use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::session::Session;

/// A presentation surface showing sessions.
///
/// The relevance hooks route a session to one destination: the first that
/// claims its id, otherwise the first that claims its thread.
pub trait Destination: Send + Sync {
    fn on_instance_added(&self, session: &Session);
    fn on_instance_updated(&self, session: &Session);
    fn on_instance_removed(&self, session: &Session);

    fn is_id_relevant(&self, _id: &str) -> bool {
        false
    }

    fn is_thread_relevant(&self, _thread_id: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DestinationId(u64);

/// What [`SessionRegistry::apply_update`] did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Malformed payload; nothing changed.
    Ignored,
    /// Terminal snapshot for a session we never saw.
    Discarded,
    Added,
    Updated,
    /// Reached a terminal phase and was dropped.
    Removed,
    /// Reached a terminal phase but was kept for review.
    Retained,
}

enum Notice {
    Added,
    Updated,
    Removed,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    destinations: Mutex<BTreeMap<DestinationId, Arc<dyn Destination>>>,
    next_destination: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_destination(&self, destination: Arc<dyn Destination>) -> DestinationId {
        let id = DestinationId(self.next_destination.fetch_add(1, Ordering::SeqCst));
        self.lock_destinations().insert(id, destination);
        id
    }

    pub fn unregister_destination(&self, id: DestinationId) -> bool {
        self.lock_destinations().remove(&id).is_some()
    }

    /// Applies one `UPDATE` payload: either the `CANDIDATE` element itself or
    /// an envelope carrying it.
    pub fn apply_update(&self, payload: &Element) -> UpdateOutcome {
        let snapshot = match CandidateSnapshot::from_element(payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Malformed candidate update");
                return UpdateOutcome::Ignored;
            }
        };
        if snapshot.state.is_unknown() {
            debug!(id = %snapshot.id, phase = %snapshot.state, "Unrecognized candidate phase");
        }

        let mut notices = Vec::new();
        let outcome = {
            let mut sessions = self.lock_sessions();
            let id = snapshot.id.clone();

            let (session, outcome) = match sessions.get_mut(&id) {
                Some(session) => {
                    session.replace_snapshot(snapshot);
                    notices.push((Notice::Updated, session.clone()));
                    (session.clone(), UpdateOutcome::Updated)
                }
                None if snapshot.state.is_terminal() => {
                    debug!(id = %id, phase = %snapshot.state, "Discarding terminal update for unseen candidate");
                    return UpdateOutcome::Discarded;
                }
                None => {
                    let session = Session::new(snapshot);
                    sessions.insert(id.clone(), session.clone());
                    notices.push((Notice::Added, session.clone()));
                    (session, UpdateOutcome::Added)
                }
            };

            if session.is_terminal() {
                let retired = if session.should_remove() {
                    sessions.remove(&id);
                    UpdateOutcome::Removed
                } else {
                    UpdateOutcome::Retained
                };
                info!(id = %id, phase = %session.phase(), retained = matches!(retired, UpdateOutcome::Retained), "Candidate finished");
                notices.push((Notice::Removed, session));
                retired
            } else {
                outcome
            }
        };

        if let Some(destination) = notices.first().and_then(|(_, session)| self.route(session)) {
            for (notice, session) in &notices {
                match notice {
                    Notice::Added => destination.on_instance_added(session),
                    Notice::Updated => destination.on_instance_updated(session),
                    Notice::Removed => destination.on_instance_removed(session),
                }
            }
        }
        outcome
    }

    /// Drops a session regardless of phase. Used to dismiss a retained
    /// session; no destination is notified.
    pub fn remove_instance(&self, id: &str) -> Option<Session> {
        self.lock_sessions().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock_sessions().get(id).cloned()
    }

    /// All sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock_sessions().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_sessions().is_empty()
    }

    pub fn mark_should_persist(&self, id: &str) -> bool {
        self.modify(id, |session| session.should_persist = true)
    }

    pub fn set_doing_query(&self, id: &str, doing_query: bool) -> bool {
        self.modify(id, |session| session.doing_query = doing_query)
    }

    /// Claims a ready, idle session for a user command: sets `doing_query`
    /// and `should_persist` and notifies its destination.
    pub fn begin_query(&self, id: &str) -> Result<Session, CommandError> {
        let session = {
            let mut sessions = self.lock_sessions();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| CommandError::UnknownSession(id.to_string()))?;
            if session.doing_query {
                return Err(CommandError::Busy(id.to_string()));
            }
            if !session.snapshot.state.is_ready() {
                return Err(CommandError::NotReady {
                    id: id.to_string(),
                    phase: session.snapshot.state.to_string(),
                });
            }
            session.doing_query = true;
            session.should_persist = true;
            session.clone()
        };
        self.notify_updated(&session);
        Ok(session)
    }

    /// Clears `doing_query` once a command's reply (or failure) is in.
    pub fn finish_query(&self, id: &str) {
        let session = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            session.doing_query = false;
            session.clone()
        };
        self.notify_updated(&session);
    }

    fn modify(&self, id: &str, change: impl FnOnce(&mut Session)) -> bool {
        let session = {
            let mut sessions = self.lock_sessions();
            let Some(session) = sessions.get_mut(id) else {
                return false;
            };
            change(session);
            session.clone()
        };
        self.notify_updated(&session);
        true
    }

    fn notify_updated(&self, session: &Session) {
        if let Some(destination) = self.route(session) {
            destination.on_instance_updated(session);
        }
    }

    fn route(&self, session: &Session) -> Option<Arc<dyn Destination>> {
        let destinations = self.lock_destinations();
        let by_id = destinations
            .values()
            .find(|destination| destination.is_id_relevant(&session.id));
        let chosen = by_id.or_else(|| {
            let thread_id = session.snapshot.thread_id()?;
            destinations
                .values()
                .find(|destination| destination.is_thread_relevant(thread_id))
        });
        chosen.cloned()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_destinations(&self) -> MutexGuard<'_, BTreeMap<DestinationId, Arc<dyn Destination>>> {
        self.destinations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
