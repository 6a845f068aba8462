//! Declarative constraint tables for typed packet messages.
use serde_json::{Map, Value};

use crate::error::LaticaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One row of a constraint table.
#[derive(Clone, Copy)]
pub struct Constraint {
    pub required: bool,
    pub kind: FieldKind,
    pub assert: Option<fn(&Value) -> bool>,
}

impl Constraint {
    pub const fn required(kind: FieldKind) -> Self {
        Self {
            required: true,
            kind,
            assert: None,
        }
    }

    pub const fn optional(kind: FieldKind) -> Self {
        Self {
            required: false,
            kind,
            assert: None,
        }
    }

    pub const fn with(mut self, assert: fn(&Value) -> bool) -> Self {
        self.assert = Some(assert);
        self
    }
}

/// Validate `message` against `table`.
///
/// Unknown keys are rejected first, then each declared field is checked
/// for presence, type and assertion. Absent optional fields are skipped.
pub fn validate_message(
    message: &Map<String, Value>,
    table: &[(&'static str, Constraint)],
) -> Result<(), LaticaError> {
    let unknown: Vec<String> = message
        .keys()
        .filter(|k| !table.iter().any(|(name, _)| *name == k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(LaticaError::UnexpectedKeys(unknown));
    }

    for &(name, c) in table {
        let value = match message.get(name) {
            Some(v) => v,
            None if c.required => return Err(LaticaError::MissingKey(name)),
            None => continue,
        };

        if !c.kind.matches(value) {
            return Err(LaticaError::WrongType {
                key: name,
                expected: c.kind.name(),
                got: kind_of(value),
            });
        }

        if let Some(assert) = c.assert {
            if !assert(value) {
                return Err(LaticaError::AssertionFailed(name));
            }
        }
    }

    Ok(())
}

// Shared assertions

pub(crate) fn is_peer_id(v: &Value) -> bool {
    v.as_str().is_some_and(crate::types::PeerId::is_valid)
}

pub(crate) fn is_token(v: &Value) -> bool {
    v.as_str().is_some_and(crate::types::is_valid_token)
}

pub(crate) fn is_summary_hash(v: &Value) -> bool {
    v.as_str()
        .is_some_and(|s| s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit()))
}

pub(crate) fn is_port(v: &Value) -> bool {
    v.as_u64().is_some_and(|n| n <= u16::MAX as u64)
}

pub(crate) fn is_nat_type(v: &Value) -> bool {
    v.as_u64().is_some_and(crate::nat::NatType::is_valid_value)
}

pub(crate) fn is_ipv4(v: &Value) -> bool {
    v.as_str()
        .is_some_and(|s| s.parse::<std::net::Ipv4Addr>().is_ok())
}
