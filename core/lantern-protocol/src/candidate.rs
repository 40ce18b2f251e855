//! Candidate snapshots pushed by the analysis worker.
//!
//! The worker owns the state machine: every `UPDATE` carries the full
//! candidate and its declared phase, and clients mirror whatever it asserts.
//! Older worker builds spell some phases differently (`NO_SYMPTOM`,
//! `INTERUPTED`); both spellings are accepted.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::element::Element;
use crate::{ProtocolError, CANDIDATE_TAG};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CandidateState {
    Initial,
    FindingSymptom,
    SymptomFound,
    DoingAnalysis,
    FindingAllLocations,
    FindingStartingFrame,
    DoingBaseExecution,
    FindingExecutedLocations,
    FinalLocations,
    PreparingData,
    Ready,
    NoSymptomFound,
    NoUserStack,
    NoAnalysis,
    NoStartFrame,
    NoLocationsFound,
    NoBaseExecution,
    NoFinalLocations,
    Dead,
    Interrupted,
    /// A phase this client does not recognize. Never treated as terminal.
    Unknown(String),
}

/// Why a terminal candidate stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// The worker could not make progress (no symptom, no stack, died...).
    Failure,
    /// The run was interrupted; a session the user worked with may be kept.
    Cancelled,
}

impl CandidateState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "INITIAL" => Self::Initial,
            "FINDING_SYMPTOM" => Self::FindingSymptom,
            "SYMPTOM_FOUND" => Self::SymptomFound,
            "DOING_ANALYSIS" => Self::DoingAnalysis,
            "FINDING_ALL_LOCATIONS" => Self::FindingAllLocations,
            "FINDING_STARTING_FRAME" => Self::FindingStartingFrame,
            "DOING_BASE_EXECUTION" => Self::DoingBaseExecution,
            "FINDING_EXECUTED_LOCATIONS" => Self::FindingExecutedLocations,
            "FINAL_LOCATIONS" => Self::FinalLocations,
            "PREPARING_DATA" => Self::PreparingData,
            "READY" => Self::Ready,
            "NO_SYMPTOM_FOUND" | "NO_SYMPTOM" => Self::NoSymptomFound,
            "NO_USER_STACK" => Self::NoUserStack,
            "NO_ANALYSIS" => Self::NoAnalysis,
            "NO_START_FRAME" => Self::NoStartFrame,
            "NO_LOCATIONS_FOUND" => Self::NoLocationsFound,
            "NO_BASE_EXECUTION" => Self::NoBaseExecution,
            "NO_FINAL_LOCATIONS" => Self::NoFinalLocations,
            "DEAD" => Self::Dead,
            "INTERRUPTED" | "INTERUPTED" => Self::Interrupted,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Initial => "INITIAL",
            Self::FindingSymptom => "FINDING_SYMPTOM",
            Self::SymptomFound => "SYMPTOM_FOUND",
            Self::DoingAnalysis => "DOING_ANALYSIS",
            Self::FindingAllLocations => "FINDING_ALL_LOCATIONS",
            Self::FindingStartingFrame => "FINDING_STARTING_FRAME",
            Self::DoingBaseExecution => "DOING_BASE_EXECUTION",
            Self::FindingExecutedLocations => "FINDING_EXECUTED_LOCATIONS",
            Self::FinalLocations => "FINAL_LOCATIONS",
            Self::PreparingData => "PREPARING_DATA",
            Self::Ready => "READY",
            Self::NoSymptomFound => "NO_SYMPTOM_FOUND",
            Self::NoUserStack => "NO_USER_STACK",
            Self::NoAnalysis => "NO_ANALYSIS",
            Self::NoStartFrame => "NO_START_FRAME",
            Self::NoLocationsFound => "NO_LOCATIONS_FOUND",
            Self::NoBaseExecution => "NO_BASE_EXECUTION",
            Self::NoFinalLocations => "NO_FINAL_LOCATIONS",
            Self::Dead => "DEAD",
            Self::Interrupted => "INTERRUPTED",
            Self::Unknown(raw) => raw.as_str(),
        }
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self {
            Self::NoSymptomFound
            | Self::NoUserStack
            | Self::NoAnalysis
            | Self::NoStartFrame
            | Self::NoLocationsFound
            | Self::NoBaseExecution
            | Self::NoFinalLocations
            | Self::Dead => Some(TerminalKind::Failure),
            Self::Interrupted => Some(TerminalKind::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_kind().is_some()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) if raw.is_empty() => f.write_str("???"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl Serialize for CandidateState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CandidateState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymptomType {
    #[default]
    None,
    Exception,
    Assertion,
    Variable,
    Expression,
    Location,
    NoException,
    CaughtException,
}

impl SymptomType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EXCEPTION" => Self::Exception,
            "ASSERTION" => Self::Assertion,
            "VARIABLE" => Self::Variable,
            "EXPRESSION" => Self::Expression,
            "LOCATION" => Self::Location,
            "NO_EXCEPTION" => Self::NoException,
            "CAUGHT_EXCEPTION" => Self::CaughtException,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueOperator {
    #[default]
    None,
    Eql,
    Neq,
    Gtr,
    Geq,
    Lss,
    Leq,
}

impl ValueOperator {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "EQL" => Self::Eql,
            "NEQ" => Self::Neq,
            "GTR" => Self::Gtr,
            "GEQ" => Self::Geq,
            "LSS" => Self::Lss,
            "LEQ" => Self::Leq,
            _ => Self::None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Eql => "==",
            Self::Neq => "!=",
            Self::Gtr => ">",
            Self::Geq => ">=",
            Self::Lss => "<",
            Self::Leq => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameInfo {
    pub class: Option<String>,
    pub method: Option<String>,
    pub line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Symptom {
    pub kind: SymptomType,
    pub operator: ValueOperator,
    pub precision: f64,
    pub item: Option<String>,
    pub original: Option<String>,
    pub target: Option<String>,
}

/// Full candidate payload from one `UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    pub id: String,
    pub state: CandidateState,
    pub thread: Option<ThreadInfo>,
    pub frame: Option<FrameInfo>,
    pub symptom: Option<Symptom>,
}

impl CandidateSnapshot {
    /// Parses a `CANDIDATE` element, unwrapping an enclosing envelope first.
    pub fn from_element(element: &Element) -> Result<Self, ProtocolError> {
        let candidate = if element.tag == CANDIDATE_TAG {
            element
        } else {
            element.child(CANDIDATE_TAG).ok_or_else(|| {
                ProtocolError::new(
                    "missing_candidate",
                    format!("{} carries no {} body", element.tag, CANDIDATE_TAG),
                )
            })?
        };

        let id = candidate
            .non_empty_attr("ID")
            .ok_or_else(|| ProtocolError::new("missing_field", "candidate ID is required"))?
            .to_string();

        let state = candidate
            .attr("STATE")
            .map(CandidateState::parse)
            .unwrap_or_else(|| CandidateState::Unknown(String::new()));

        let thread = candidate.child("THREAD").map(|thread| ThreadInfo {
            id: owned(thread.non_empty_attr("ID")),
            name: owned(thread.non_empty_attr("NAME")),
        });

        let frame = candidate.child("FRAME").map(|frame| FrameInfo {
            class: owned(frame.non_empty_attr("CLASS")),
            method: owned(frame.attr("METHOD")),
            line: owned(frame.non_empty_attr("LINE")),
        });

        let symptom = candidate.child("SYMPTOM").map(|symptom| Symptom {
            kind: symptom
                .attr("TYPE")
                .map(SymptomType::parse)
                .unwrap_or_default(),
            operator: symptom
                .attr("OPERATOR")
                .map(ValueOperator::parse)
                .unwrap_or_default(),
            precision: symptom.attr_f64("PRECISION").unwrap_or(0.0),
            item: owned(symptom.child_text("ITEM")),
            original: owned(symptom.child_text("ORIGINAL")),
            target: owned(symptom.child_text("TARGET")),
        });

        Ok(Self {
            id,
            state,
            thread,
            frame,
            symptom,
        })
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|thread| thread.id.as_deref())
    }

    pub fn thread_name(&self) -> Option<&str> {
        self.thread.as_ref().and_then(|thread| thread.name.as_deref())
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(state: &str) -> Element {
        Element::new(CANDIDATE_TAG)
            .with_attr("ID", "C1")
            .with_attr("STATE", state)
            .with_child(
                Element::new("THREAD")
                    .with_attr("ID", "T17")
                    .with_attr("NAME", "main"),
            )
            .with_child(
                Element::new("FRAME")
                    .with_attr("CLASS", "org.example.Parser")
                    .with_attr("METHOD", "parse")
                    .with_attr("LINE", "42"),
            )
            .with_child(
                Element::new("SYMPTOM")
                    .with_attr("TYPE", "VARIABLE")
                    .with_attr("OPERATOR", "EQL")
                    .with_attr("PRECISION", "0.001")
                    .with_child(Element::new("ITEM").with_text("count"))
                    .with_child(Element::new("ORIGINAL").with_text("3"))
                    .with_child(Element::new("TARGET").with_text("4")),
            )
    }

    #[test]
    fn parses_full_candidate() {
        let snapshot = CandidateSnapshot::from_element(&candidate("READY")).expect("parse");

        assert_eq!(snapshot.id, "C1");
        assert_eq!(snapshot.state, CandidateState::Ready);
        assert_eq!(snapshot.thread_id(), Some("T17"));
        assert_eq!(snapshot.thread_name(), Some("main"));
        let frame = snapshot.frame.expect("frame");
        assert_eq!(frame.line.as_deref(), Some("42"));
        let symptom = snapshot.symptom.expect("symptom");
        assert_eq!(symptom.kind, SymptomType::Variable);
        assert_eq!(symptom.operator, ValueOperator::Eql);
        assert!((symptom.precision - 0.001).abs() < f64::EPSILON);
        assert_eq!(symptom.target.as_deref(), Some("4"));
    }

    #[test]
    fn unwraps_update_envelope() {
        let envelope = Element::new("DIADREPLY")
            .with_attr("DO", "UPDATE")
            .with_child(candidate("DOING_ANALYSIS"));

        let snapshot = CandidateSnapshot::from_element(&envelope).expect("parse");
        assert_eq!(snapshot.state, CandidateState::DoingAnalysis);
    }

    #[test]
    fn envelope_without_candidate_is_rejected() {
        let envelope = Element::new("DIADREPLY").with_attr("DO", "UPDATE");
        let err = CandidateSnapshot::from_element(&envelope).expect_err("should fail");
        assert_eq!(err.code, "missing_candidate");
    }

    #[test]
    fn blank_id_is_rejected() {
        let element = Element::new(CANDIDATE_TAG)
            .with_attr("ID", "  ")
            .with_attr("STATE", "READY");
        let err = CandidateSnapshot::from_element(&element).expect_err("should fail");
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn missing_or_unrecognized_state_is_unknown_not_dead() {
        let element = Element::new(CANDIDATE_TAG).with_attr("ID", "C9");
        let snapshot = CandidateSnapshot::from_element(&element).expect("parse");
        assert!(snapshot.state.is_unknown());
        assert!(!snapshot.state.is_terminal());
        assert_eq!(snapshot.state.to_string(), "???");

        assert_eq!(
            CandidateState::parse("WARMING_UP"),
            CandidateState::Unknown("WARMING_UP".to_string())
        );
    }

    #[test]
    fn accepts_legacy_phase_spellings() {
        assert_eq!(
            CandidateState::parse("NO_SYMPTOM"),
            CandidateState::NoSymptomFound
        );
        assert_eq!(
            CandidateState::parse("INTERUPTED"),
            CandidateState::Interrupted
        );
        assert_eq!(
            CandidateState::Interrupted.terminal_kind(),
            Some(TerminalKind::Cancelled)
        );
    }

    #[test]
    fn ready_is_not_terminal() {
        assert!(!CandidateState::Ready.is_terminal());
        assert!(CandidateState::Dead.is_terminal());
        assert!(CandidateState::NoFinalLocations.is_terminal());
        assert!(!CandidateState::PreparingData.is_terminal());
    }

    #[test]
    fn state_serializes_as_wire_name() {
        let json = serde_json::to_string(&CandidateState::FindingSymptom).expect("serialize");
        assert_eq!(json, "\"FINDING_SYMPTOM\"");
        let parsed: CandidateState = serde_json::from_str("\"INTERUPTED\"").expect("parse");
        assert_eq!(parsed, CandidateState::Interrupted);
    }
}
