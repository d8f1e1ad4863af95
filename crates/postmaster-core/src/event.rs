//! Captured cross-document messages and their schema validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Origin reported by the probe when the message event carried none.
pub const UNKNOWN_ORIGIN: &str = "Unknown";

/// A cross-document message as captured inside a monitored context.
///
/// Instances only come into existence through [`parse_event`] (or the
/// `TryFrom<Value>` impl that wraps it), so every field is guaranteed to be
/// present and both times are finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct CapturedEvent {
    /// Source of the message, or [`UNKNOWN_ORIGIN`].
    pub origin: String,
    /// Location of the receiving document.
    pub destination: String,
    /// Opaque message payload.
    pub data: Value,
    /// Milliseconds since navigation start in the capturing context.
    pub timestamp: f64,
    /// Wall-clock capture time in milliseconds since the Unix epoch.
    pub datetime: f64,
}

impl CapturedEvent {
    /// Create an event from its parts.
    #[must_use]
    pub fn new(
        origin: impl Into<String>,
        destination: impl Into<String>,
        data: Value,
        timestamp: f64,
        datetime: f64,
    ) -> Self {
        Self {
            origin: origin.into(),
            destination: destination.into(),
            data,
            timestamp,
            datetime,
        }
    }

    /// The payload rendered as compact JSON, the form filters match against.
    #[must_use]
    pub fn data_text(&self) -> String {
        self.data.to_string()
    }
}

impl From<CapturedEvent> for Value {
    fn from(event: CapturedEvent) -> Self {
        json!({
            "origin": event.origin,
            "destination": event.destination,
            "data": event.data,
            "timestamp": event.timestamp,
            "datetime": event.datetime,
        })
    }
}

impl TryFrom<Value> for CapturedEvent {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        parse_event(&value)
    }
}

/// Reason an inbound payload was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload is not an object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Check an untrusted payload against the captured-event schema.
///
/// Fields are checked in declaration order and the first failure wins.
/// Keys outside the schema are ignored.
///
/// # Errors
/// Returns the first schema violation found.
pub fn parse_event(raw: &Value) -> Result<CapturedEvent, ValidationError> {
    let object = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    let origin = string_field(object, "origin")?;
    let destination = string_field(object, "destination")?;
    let data = object
        .get("data")
        .cloned()
        .ok_or(ValidationError::MissingField("data"))?;
    let timestamp = number_field(object, "timestamp")?;
    let datetime = number_field(object, "datetime")?;

    Ok(CapturedEvent {
        origin,
        destination,
        data,
        timestamp,
        datetime,
    })
}

/// Validate a payload, discarding the rejection reason.
#[must_use]
pub fn validate(raw: &Value) -> Option<CapturedEvent> {
    match parse_event(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::trace!(error = %e, "Rejected inbound payload");
            None
        }
    }
}

fn string_field(object: &Map<String, Value>, field: &'static str) -> Result<String, ValidationError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
        None => Err(ValidationError::MissingField(field)),
    }
}

fn number_field(object: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    let value = object.get(field).ok_or(ValidationError::MissingField(field))?;
    value
        .as_f64()
        .filter(|n| n.is_finite())
        .ok_or(ValidationError::WrongType {
            field,
            expected: "a finite number",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Value {
        json!({
            "origin": "https://a.example",
            "destination": "https://b.example/page",
            "data": { "kind": "hello" },
            "timestamp": 1520.25,
            "datetime": 1_700_000_000_000_u64,
        })
    }

    #[test]
    fn test_accepts_well_formed_payload() {
        let event = validate(&payload()).unwrap();
        assert_eq!(event.origin, "https://a.example");
        assert_eq!(event.destination, "https://b.example/page");
        assert_eq!(event.data, json!({ "kind": "hello" }));
        assert!((event.timestamp - 1520.25).abs() < f64::EPSILON);
        assert!((event.datetime - 1.7e12).abs() < 1.0);
    }

    #[test]
    fn test_rejects_non_object() {
        assert_eq!(parse_event(&json!([1, 2])), Err(ValidationError::NotAnObject));
        assert_eq!(parse_event(&json!("text")), Err(ValidationError::NotAnObject));
        assert!(validate(&Value::Null).is_none());
    }

    #[test]
    fn test_rejects_missing_timestamp() {
        let mut raw = payload();
        raw.as_object_mut().unwrap().remove("timestamp");
        assert_eq!(
            parse_event(&raw),
            Err(ValidationError::MissingField("timestamp"))
        );
    }

    #[test]
    fn test_rejects_string_timestamp() {
        let mut raw = payload();
        raw["timestamp"] = json!("1520");
        assert!(matches!(
            parse_event(&raw),
            Err(ValidationError::WrongType { field: "timestamp", .. })
        ));
    }

    #[test]
    fn test_reports_first_failing_field() {
        let raw = json!({ "origin": 7, "timestamp": "x" });
        assert!(matches!(
            parse_event(&raw),
            Err(ValidationError::WrongType { field: "origin", .. })
        ));
    }

    #[test]
    fn test_data_must_be_present_but_may_be_null() {
        let mut raw = payload();
        raw["data"] = Value::Null;
        assert_eq!(validate(&raw).unwrap().data, Value::Null);

        raw.as_object_mut().unwrap().remove("data");
        assert_eq!(parse_event(&raw), Err(ValidationError::MissingField("data")));
    }

    #[test]
    fn test_ignores_extra_keys() {
        let mut raw = payload();
        raw["contextId"] = json!(42);
        let event = validate(&raw).unwrap();
        assert_eq!(Value::from(event), payload_as_floats());
    }

    fn payload_as_floats() -> Value {
        json!({
            "origin": "https://a.example",
            "destination": "https://b.example/page",
            "data": { "kind": "hello" },
            "timestamp": 1520.25,
            "datetime": 1_700_000_000_000_f64,
        })
    }

    #[test]
    fn test_deserialize_goes_through_validation() {
        let ok: Result<CapturedEvent, _> = serde_json::from_value(payload());
        assert!(ok.is_ok());

        let bad: Result<CapturedEvent, _> =
            serde_json::from_value(json!({ "origin": "x", "destination": "y" }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_data_text_is_compact_json() {
        let event = validate(&payload()).unwrap();
        assert_eq!(event.data_text(), r#"{"kind":"hello"}"#);
    }
}
