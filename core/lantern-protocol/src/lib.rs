//! Bus message types and envelope builders for Lantern.
//!
//! This crate is shared by the assistant core, its CLI, and test fakes so the
//! wire vocabulary lives in one place. Tag and attribute names are the ones the
//! analysis worker speaks and must not be renamed.

use serde::{Deserialize, Serialize};

pub mod candidate;
pub mod element;

pub use candidate::{
    CandidateSnapshot, CandidateState, FrameInfo, Symptom, SymptomType, TerminalKind, ThreadInfo,
    ValueOperator,
};
pub use element::{AttrMatch, Element, Pattern};

pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB

/// Requests addressed to the analysis worker.
pub const COMMAND_TAG: &str = "DIAD";
/// Requests addressed to the model-serving worker.
pub const MODEL_TAG: &str = "LIMBA";
/// Everything the analysis worker sends back: deferred replies and pushes.
pub const REPLY_TAG: &str = "DIADREPLY";
pub const CANDIDATE_TAG: &str = "CANDIDATE";
pub const RESULT_TAG: &str = "RESULT";
pub const PONG_TAG: &str = "PONG";
pub const ACK_TAG: &str = "ACK";

pub const ATTR_VERB: &str = "DO";
pub const ATTR_REPLY_ID: &str = "RID";
pub const ATTR_SESSION_ID: &str = "ID";
pub const ATTR_RESPONSE: &str = "RESPONSE";

pub const VERB_PING: &str = "PING";
pub const VERB_UPDATE: &str = "UPDATE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: String,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// One newline-delimited JSON frame on a socket transport.
///
/// A frame with `reply_to` set answers the frame with that `seq`; a reply with
/// no `message` is a null reply (an ack with nothing to say).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusFrame {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Element>,
}

impl BusFrame {
    pub fn message(seq: u64, message: Element) -> Self {
        Self {
            seq,
            reply_to: None,
            message: Some(message),
        }
    }

    pub fn reply(seq: u64, reply_to: u64, message: Option<Element>) -> Self {
        Self {
            seq,
            reply_to: Some(reply_to),
            message,
        }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.reply_to.is_none() && self.message.is_none() {
            return Err(ProtocolError::new(
                "empty_frame",
                "frames that are not replies must carry a message",
            ));
        }
        if let Some(message) = &self.message {
            if message.tag.trim().is_empty() {
                return Err(ProtocolError::new("invalid_tag", "message tag is required"));
            }
        }
        Ok(())
    }
}

pub fn parse_frame(line: &[u8]) -> Result<BusFrame, ProtocolError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::new(
            "frame_too_large",
            format!("frame of {} bytes exceeds {}", line.len(), MAX_FRAME_BYTES),
        ));
    }
    let frame: BusFrame = serde_json::from_slice(line).map_err(|err| {
        ProtocolError::new("invalid_frame", format!("frame is invalid JSON: {}", err))
    })?;
    frame.validate()?;
    Ok(frame)
}

/// `<DIAD DO=verb ...args>body</DIAD>`
pub fn command(verb: &str, args: &[(&str, String)], body: Option<Element>) -> Element {
    let mut message = Element::new(COMMAND_TAG).with_attr(ATTR_VERB, verb);
    for (name, value) in args {
        message.set_attr(*name, value);
    }
    if let Some(body) = body {
        message.children.push(body);
    }
    message
}

/// Zero-argument liveness probe addressed to `tag`.
pub fn ping(tag: &str) -> Element {
    Element::new(tag).with_attr(ATTR_VERB, VERB_PING)
}

pub fn pong() -> Element {
    Element::new(PONG_TAG)
}

pub fn ack() -> Element {
    Element::new(ACK_TAG)
}

/// `<DIADREPLY DO=UPDATE>candidate</DIADREPLY>`
pub fn update(candidate: Element) -> Element {
    Element::new(REPLY_TAG)
        .with_attr(ATTR_VERB, VERB_UPDATE)
        .with_child(candidate)
}

/// `<DIADREPLY RID=token><RESULT .../></DIADREPLY>`
pub fn deferred_reply(reply_id: &str, result: Option<Element>) -> Element {
    let mut message = Element::new(REPLY_TAG).with_attr(ATTR_REPLY_ID, reply_id);
    if let Some(result) = result {
        message.children.push(result);
    }
    message
}
