//! Tagged message tree shared by every bus transport.
//!
//! Messages on the bus are shaped like small XML documents: a tag, a flat set
//! of string attributes, optional text, and nested children. Transports carry
//! them as JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.insert(name.into(), value.to_string());
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl ToString) {
        self.attrs.insert(name.into(), value.to_string());
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Attribute value, treating blank strings as absent.
    pub fn non_empty_attr(&self, name: &str) -> Option<&str> {
        self.attr(name).filter(|value| !value.trim().is_empty())
    }

    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attr(name).and_then(|value| value.trim().parse().ok())
    }

    /// First child with the given tag.
    pub fn child(&self, tag: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.tag == tag)
    }

    /// Text content of the first child with the given tag.
    pub fn child_text(&self, tag: &str) -> Option<&str> {
        self.child(tag).and_then(|child| child.text.as_deref())
    }
}

/// How a single attribute of a [`Pattern`] is matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrMatch {
    Exact(String),
    /// Matches any value and records it as a capture.
    Capture,
}

/// Inbound message shape a bus handler is registered for.
///
/// `Pattern::new("DIADREPLY").capture("RID")` matches every `DIADREPLY`
/// carrying an `RID` attribute and hands the token to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    tag: String,
    attrs: Vec<(String, AttrMatch)>,
}

impl Pattern {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
        }
    }

    pub fn exact(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs
            .push((name.into(), AttrMatch::Exact(value.into())));
        self
    }

    pub fn capture(mut self, name: impl Into<String>) -> Self {
        self.attrs.push((name.into(), AttrMatch::Capture));
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns the captured attribute values in declaration order, or `None`
    /// when the element does not match.
    pub fn matches(&self, element: &Element) -> Option<Vec<String>> {
        if element.tag != self.tag {
            return None;
        }

        let mut captures = Vec::new();
        for (name, rule) in &self.attrs {
            let value = element.attr(name)?;
            match rule {
                AttrMatch::Exact(expected) if expected != value => return None,
                AttrMatch::Exact(_) => {}
                AttrMatch::Capture => captures.push(value.to_string()),
            }
        }
        Some(captures)
    }
}
