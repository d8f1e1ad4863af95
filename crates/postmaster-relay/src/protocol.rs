//! Control messages exchanged between panels, probes and the relay.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

/// Identifier of a monitored context; the relay routing key.
///
/// Hosts hand out numeric ids (browser tab ids) as often as strings, so both
/// JSON forms are accepted and normalised to text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ContextId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ContextId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ContextId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

/// Message from a panel (or probe) to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Register the sending channel for a context and install the probe.
    #[serde(rename = "INIT", alias = "POST_MASTER_INIT")]
    Init {
        #[serde(rename = "contextId", alias = "tabId")]
        context_id: ContextId,
    },
    /// Liveness check.
    #[serde(rename = "PING")]
    Ping,
}

impl ControlMessage {
    /// Interpret a raw message, if it is a control message at all.
    #[must_use]
    pub fn parse(raw: &Value) -> Option<Self> {
        Self::deserialize(raw).ok()
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Init { context_id } => json!({ "type": "INIT", "contextId": context_id }),
            Self::Ping => json!({ "type": "PING" }),
        }
    }
}

/// Message from the relay back to a panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    /// Acknowledges a `PING`.
    #[serde(rename = "PONG")]
    Pong,
}

impl Reply {
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            Self::Pong => json!({ "type": "PONG" }),
        }
    }

    /// Whether `raw` is a heartbeat acknowledgement rather than traffic.
    #[must_use]
    pub fn is_pong(raw: &Value) -> bool {
        matches!(Self::deserialize(raw), Ok(Self::Pong))
    }
}
