// Push payloads and the conversion contract for pushable domain objects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::Envelope;

/// Operation a payload applies to the object it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Upsert,
    Remove,
}

impl Op {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "UPSERT",
            Self::Remove => "REMOVE",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = PayloadError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "UPSERT" => Ok(Self::Upsert),
            "REMOVE" => Ok(Self::Remove),
            other => Err(PayloadError::UnknownOp(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload kind must not be empty")]
    EmptyKind,
    #[error("unknown push operation `{0}`")]
    UnknownOp(String),
    #[error("envelope is not a push")]
    NotAPush,
    #[error("failed to encode payload data: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The unit of pushed data.
///
/// Fields are private so a payload cannot change after it is built; the
/// engine shares one instance between recipients behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    kind: String,
    op: Op,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    data: Value,
}

impl Payload {
    pub fn new(
        kind: impl Into<String>,
        op: Op,
        uri: impl Into<String>,
        data: Value,
    ) -> Result<Self, PayloadError> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(PayloadError::EmptyKind);
        }
        Ok(Self { kind, op, uri: uri.into(), data })
    }

    /// Build a payload whose data is the JSON encoding of `value`.
    pub fn from_serializable<T: Serialize>(
        kind: impl Into<String>,
        op: Op,
        uri: impl Into<String>,
        value: &T,
    ) -> Result<Self, PayloadError> {
        Self::new(kind, op, uri, serde_json::to_value(value)?)
    }

    /// Recover a payload from a push envelope (the broker frame format).
    pub fn from_push_envelope(envelope: &Envelope) -> Result<Self, PayloadError> {
        if !envelope.push {
            return Err(PayloadError::NotAPush);
        }
        let op = envelope.method.parse::<Op>()?;
        Self::new(
            envelope.rid.clone(),
            op,
            envelope.uri.clone(),
            envelope.data.clone().unwrap_or(Value::Null),
        )
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}

/// Anything that can be delivered through the push engine.
pub trait Pushable {
    fn build_payload(&self) -> Result<Payload, PayloadError>;
}

impl Pushable for Payload {
    fn build_payload(&self) -> Result<Payload, PayloadError> {
        Ok(self.clone())
    }
}
