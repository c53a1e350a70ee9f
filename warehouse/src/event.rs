use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::api::EventError;

/// A payload value. The set is closed so canonicalization and serialization are
/// total over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    // Only reached for integers above i64::MAX
    UInt(u64),
    Float(f64),
    String(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

/// Payload keys are kept sorted, which is what makes the canonical form
/// independent of the order a producer built the mapping in.
pub type Payload = BTreeMap<String, PayloadValue>;

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Int(value)
    }
}

impl From<u64> for PayloadValue {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => PayloadValue::Int(value),
            Err(_) => PayloadValue::UInt(value),
        }
    }
}

impl From<i32> for PayloadValue {
    fn from(value: i32) -> Self {
        PayloadValue::Int(i64::from(value))
    }
}

impl From<f64> for PayloadValue {
    fn from(value: f64) -> Self {
        PayloadValue::Float(value)
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::String(value.to_owned())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::String(value)
    }
}

impl From<Vec<PayloadValue>> for PayloadValue {
    fn from(value: Vec<PayloadValue>) -> Self {
        PayloadValue::List(value)
    }
}

impl From<Payload> for PayloadValue {
    fn from(value: Payload) -> Self {
        PayloadValue::Map(value)
    }
}

/// One unit of ingested business data.
///
/// Fields are only reachable through accessors: an `Event` that exists has
/// passed validation, and its identity can only be set by
/// [`crate::identity::assign`] or by reading an already fingerprinted event off
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvent")]
pub struct Event {
    source: String,
    event_type: String,
    #[serde(serialize_with = "serialize_timestamp")]
    timestamp: OffsetDateTime,
    payload: Payload,
    identity: Option<String>,
}

/// Wire shape of an event before validation.
#[derive(Debug, Deserialize)]
struct RawEvent {
    source: Option<String>,
    event_type: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    payload: Option<Payload>,
    #[serde(default)]
    identity: Option<String>,
}

impl TryFrom<RawEvent> for Event {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        let mut event = Event::at(
            raw.source.unwrap_or_default(),
            raw.event_type.unwrap_or_default(),
            raw.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            raw.payload.unwrap_or_default(),
        )?;
        event.identity = raw.identity.filter(|identity| !identity.is_empty());
        Ok(event)
    }
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: Payload,
    ) -> Result<Self, EventError> {
        Self::at(source, event_type, OffsetDateTime::now_utc(), payload)
    }

    /// Build an event with a producer-supplied timestamp.
    pub fn at(
        source: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: OffsetDateTime,
        payload: Payload,
    ) -> Result<Self, EventError> {
        let source = source.into();
        let event_type = event_type.into();

        if source.is_empty() {
            return Err(EventError::MissingSource);
        }
        if event_type.is_empty() {
            return Err(EventError::MissingEventType);
        }
        if payload.is_empty() {
            return Err(EventError::EmptyPayload);
        }
        for (key, value) in &payload {
            check_finite(value, key)?;
        }
        canonical_timestamp(&timestamp)?;

        Ok(Self {
            source,
            event_type,
            timestamp,
            payload,
            identity: None,
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub(crate) fn set_identity(&mut self, identity: String) {
        debug_assert!(self.identity.is_none(), "identity is assigned once");
        self.identity = Some(identity);
    }

    /// Flat document form: `source`, `event_type`, `timestamp`, `payload`,
    /// `identity`.
    pub fn to_document(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(document) => Ok(document),
            // Event always serializes as a struct
            other => Err(serde::ser::Error::custom(format!(
                "expected an object, got {other}"
            ))),
        }
    }
}

/// UTC, RFC 3339, sub-second digits only when present.
pub fn canonical_timestamp(timestamp: &OffsetDateTime) -> Result<String, EventError> {
    timestamp
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|e| EventError::InvalidTimestamp(e.to_string()))
}

fn serialize_timestamp<S>(timestamp: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let formatted = canonical_timestamp(timestamp).map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

fn check_finite(value: &PayloadValue, path: &str) -> Result<(), EventError> {
    match value {
        PayloadValue::Float(f) if !f.is_finite() => {
            Err(EventError::NonFiniteNumber(path.to_owned()))
        }
        PayloadValue::List(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(index, item)| check_finite(item, &format!("{path}[{index}]"))),
        PayloadValue::Map(map) => map
            .iter()
            .try_for_each(|(key, item)| check_finite(item, &format!("{path}.{key}"))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn payload() -> Payload {
        Payload::from([("x".to_string(), PayloadValue::from(1))])
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert_eq!(
            Event::new("", "click", payload()).unwrap_err(),
            EventError::MissingSource
        );
        assert_eq!(
            Event::new("svc-a", "", payload()).unwrap_err(),
            EventError::MissingEventType
        );
        assert_eq!(
            Event::new("svc-a", "click", Payload::new()).unwrap_err(),
            EventError::EmptyPayload
        );
    }

    #[test]
    fn rejects_non_finite_numbers_anywhere_in_payload() {
        let nested = Payload::from([(
            "inner".to_string(),
            PayloadValue::List(vec![PayloadValue::from(1.0), PayloadValue::from(f64::NAN)]),
        )]);
        let payload = Payload::from([("outer".to_string(), PayloadValue::Map(nested))]);

        assert_eq!(
            Event::new("svc-a", "click", payload).unwrap_err(),
            EventError::NonFiniteNumber("outer.inner[1]".to_string())
        );
    }

    #[test]
    fn serializes_to_flat_wire_shape() {
        let event = Event::at(
            "svc-a",
            "click",
            datetime!(2024-01-01 2:00 +2),
            payload(),
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "source": "svc-a",
                "event_type": "click",
                "timestamp": "2024-01-01T00:00:00Z",
                "payload": {"x": 1},
                "identity": null,
            })
        );
    }

    #[test]
    fn deserializes_payload_variants() {
        let event = Event::from_slice(
            br#"{
                "source": "svc-a",
                "event_type": "click",
                "timestamp": "2024-01-01T00:00:00Z",
                "payload": {"n": null, "b": true, "i": -3, "f": 2.5, "s": "x", "l": [1, "a"], "m": {"k": false}},
                "identity": "abc"
            }"#,
        )
        .unwrap();

        let payload = event.payload();
        assert_eq!(payload["n"], PayloadValue::Null);
        assert_eq!(payload["b"], PayloadValue::Bool(true));
        assert_eq!(payload["i"], PayloadValue::Int(-3));
        assert_eq!(payload["f"], PayloadValue::Float(2.5));
        assert_eq!(payload["s"], PayloadValue::from("x"));
        assert_eq!(
            payload["l"],
            PayloadValue::List(vec![PayloadValue::Int(1), PayloadValue::from("a")])
        );
        assert_eq!(
            payload["m"],
            PayloadValue::Map(Payload::from([("k".to_string(), PayloadValue::Bool(false))]))
        );
        assert_eq!(event.identity(), Some("abc"));
        assert_eq!(event.timestamp(), datetime!(2024-01-01 0:00 UTC));
    }

    #[test]
    fn deserialization_defaults_timestamp_and_validates() {
        let before = OffsetDateTime::now_utc();
        let event =
            Event::from_slice(br#"{"source": "svc-a", "event_type": "click", "payload": {"x": 1}}"#)
                .unwrap();
        assert!(event.timestamp() >= before);
        assert_eq!(event.identity(), None);

        assert!(Event::from_slice(br#"{"event_type": "click", "payload": {"x": 1}}"#).is_err());
        assert!(Event::from_slice(br#"{"source": "a", "event_type": "click", "payload": {}}"#).is_err());
        assert!(Event::from_slice(b"not json").is_err());
    }

    #[test]
    fn to_document_keeps_identity_field() {
        let mut event = Event::new("svc-a", "click", payload()).unwrap();
        event.set_identity("h".to_string());

        let document = event.to_document().unwrap();
        assert_eq!(document["identity"], json!("h"));
        assert_eq!(document["payload"], json!({"x": 1}));
        assert_eq!(document.len(), 5);
    }
}
