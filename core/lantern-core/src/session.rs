//! Per-candidate session state and the strings the panel shows for it.
//!
//! A session mirrors the worker's latest snapshot: the phase is whatever the
//! last `UPDATE` asserted, with no local transition table. Everything the UI
//! displays is derived from the snapshot on demand.

use chrono::{DateTime, Utc};
use lantern_protocol::{
    CandidateSnapshot, CandidateState, Symptom, SymptomType, TerminalKind, ValueOperator,
};
use serde::Serialize;

const UNKNOWN_TEXT: &str = "???";
const PENDING_TEXT: &str = "<TBD>";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub id: String,
    pub snapshot: CandidateSnapshot,
    /// Set once the user issues a command; an interrupted session the user
    /// worked with stays listed for review.
    pub should_persist: bool,
    /// A user command is in flight.
    pub doing_query: bool,
    pub updated_at: DateTime<Utc>,
}

/// Coarse color bucket for a session tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    InProgress,
    Ready,
    Failed,
    Unknown,
}

/// User commands available on a ready session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Query,
    Explain,
    Locations,
    Repairs,
}

impl CommandKind {
    pub fn verb(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Explain => "EXPLAIN",
            Self::Locations => "LOCATIONS",
            Self::Repairs => "REPAIRS",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "QUERY" => Some(Self::Query),
            "EXPLAIN" => Some(Self::Explain),
            "LOCATIONS" => Some(Self::Locations),
            "REPAIRS" => Some(Self::Repairs),
            _ => None,
        }
    }
}

impl Session {
    pub fn new(snapshot: CandidateSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            snapshot,
            should_persist: false,
            doing_query: false,
            updated_at: Utc::now(),
        }
    }

    pub fn phase(&self) -> &CandidateState {
        &self.snapshot.state
    }

    /// Replaces the snapshot wholesale. Fields absent from `snapshot` are
    /// gone afterwards, not carried over.
    pub fn replace_snapshot(&mut self, snapshot: CandidateSnapshot) {
        self.snapshot = snapshot;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot.state.is_terminal()
    }

    /// Whether reaching the current phase drops the session from the
    /// registry. Interrupted sessions the user worked with are kept.
    pub fn should_remove(&self) -> bool {
        match self.snapshot.state.terminal_kind() {
            Some(TerminalKind::Failure) => true,
            Some(TerminalKind::Cancelled) => !self.should_persist,
            None => false,
        }
    }

    /// Commands are offered only on a ready session with nothing in flight.
    pub fn commands_enabled(&self) -> bool {
        self.snapshot.state.is_ready() && !self.doing_query
    }

    /// Thread name, falling back to the session id.
    pub fn title(&self) -> String {
        match self.snapshot.thread_name() {
            Some(name) => name.to_string(),
            None => self.id.clone(),
        }
    }

    /// `"<line> @ <Class>.<method>"`, dropping whichever parts are missing.
    pub fn location_string(&self) -> String {
        let Some(frame) = &self.snapshot.frame else {
            return PENDING_TEXT.to_string();
        };

        let mut location = String::new();
        if let Some(line) = &frame.line {
            location.push_str(line);
            location.push_str(" @ ");
        }
        if let Some(class) = &frame.class {
            location.push_str(short_name(class));
            location.push('.');
        }
        location.push_str(frame.method.as_deref().unwrap_or(PENDING_TEXT));
        location
    }

    pub fn symptom_string(&self) -> String {
        match &self.snapshot.symptom {
            Some(symptom) => describe_symptom(symptom),
            None => describe_symptom(&Symptom::default()),
        }
    }

    pub fn status_color(&self) -> StatusColor {
        let state = &self.snapshot.state;
        if state.is_terminal() {
            StatusColor::Failed
        } else if state.is_ready() {
            StatusColor::Ready
        } else if state.is_unknown() {
            StatusColor::Unknown
        } else {
            StatusColor::InProgress
        }
    }

    /// Theme key for the tab, e.g. `tab.finding_symptom`.
    pub fn style_key(&self) -> String {
        let phase = match &self.snapshot.state {
            CandidateState::Unknown(_) => "unknown".to_string(),
            state => state.as_str().to_ascii_lowercase(),
        };
        format!("tab.{}", phase)
    }
}

fn describe_symptom(symptom: &Symptom) -> String {
    let item = symptom.item.as_deref();
    let original = symptom.original.as_deref();
    let target = symptom.target.as_deref();

    match symptom.kind {
        SymptomType::None => "No Symptom Found".to_string(),
        SymptomType::Exception | SymptomType::CaughtException => format!(
            "Exception {} was thrown",
            item.map(short_name).unwrap_or(UNKNOWN_TEXT)
        ),
        SymptomType::Assertion => {
            let contents = match (symptom.operator, original, target) {
                (operator, Some(original), Some(target)) if operator != ValueOperator::None => {
                    let approx = if symptom.precision != 0.0 { "~" } else { "" };
                    Some(format!(
                        "{} {}{} {}",
                        original,
                        approx,
                        operator.symbol(),
                        target
                    ))
                }
                _ => item.or(original).map(str::to_string),
            };
            match contents {
                Some(contents) => format!("Assertion failed: {}", contents),
                None => "Assertion failed".to_string(),
            }
        }
        SymptomType::Variable | SymptomType::Expression => {
            let kind = if symptom.kind == SymptomType::Variable {
                "Variable"
            } else {
                "Expression"
            };
            format!(
                "{} {} = {}, should be {}",
                kind,
                item.unwrap_or(UNKNOWN_TEXT),
                original.unwrap_or(UNKNOWN_TEXT),
                target.unwrap_or(UNKNOWN_TEXT)
            )
        }
        SymptomType::Location => "Execution should not be here".to_string(),
        SymptomType::NoException => format!(
            "Exception {} should have been thrown",
            item.map(short_name).unwrap_or(UNKNOWN_TEXT)
        ),
    }
}

/// Last dotted segment of a qualified name.
fn short_name(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}
