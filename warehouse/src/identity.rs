//! Deterministic event fingerprints.
//!
//! An identity is `sha256(domain || canonical)` rendered as lowercase hex, where
//! `canonical` is the compact JSON array
//! `[source, event_type, timestamp, payload]` with the timestamp in UTC RFC 3339
//! form and payload keys sorted at every level. Encoding the four inputs as one
//! JSON array keeps field boundaries unambiguous, and sorted keys keep the
//! result stable across runs, processes and producers written in other
//! languages.
//!
//! Deduplication downstream relies entirely on this function: two deliveries
//! of the same logical event must hash the same, and the hash must cover every
//! field that tells two events apart.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::api::EventError;
use crate::event::{canonical_timestamp, Event, Payload};

const IDENTITY_DOMAIN_SEPARATOR: &[u8] = b"warehouse:event-identity:v1\0";

/// Assign an identity to `event` unless it already carries one, and return it.
pub fn assign(event: &mut Event) -> Result<&str, EventError> {
    if event.identity().is_none() {
        let identity = fingerprint(
            event.source(),
            event.event_type(),
            &event.timestamp(),
            event.payload(),
        )?;
        event.set_identity(identity);
    }

    // Set just above when missing
    Ok(event.identity().unwrap_or_default())
}

/// Recompute the fingerprint and compare it with the identity the event carries.
pub fn verify(event: &Event) -> bool {
    let Some(claimed) = event.identity() else {
        return false;
    };

    match fingerprint(
        event.source(),
        event.event_type(),
        &event.timestamp(),
        event.payload(),
    ) {
        Ok(computed) => computed == claimed,
        Err(_) => false,
    }
}

pub fn fingerprint(
    source: &str,
    event_type: &str,
    timestamp: &OffsetDateTime,
    payload: &Payload,
) -> Result<String, EventError> {
    let canonical = canonical_form(source, event_type, timestamp, payload)?;

    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_DOMAIN_SEPARATOR);
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// The exact string that gets hashed, minus the domain separator.
pub fn canonical_form(
    source: &str,
    event_type: &str,
    timestamp: &OffsetDateTime,
    payload: &Payload,
) -> Result<String, EventError> {
    let timestamp = canonical_timestamp(timestamp)?;

    // A tuple serializes as a JSON array; the BTreeMap payload as a sorted object.
    serde_json::to_string(&(source, event_type, timestamp, payload))
        .map_err(|e| EventError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PayloadValue;
    use time::macros::datetime;

    fn parse_payload(json: &str) -> Payload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn matches_known_vector() {
        let payload = Payload::from([("x".to_string(), PayloadValue::from(1))]);
        let timestamp = datetime!(2024-01-01 0:00 UTC);

        assert_eq!(
            canonical_form("svc-a", "click", &timestamp, &payload).unwrap(),
            r#"["svc-a","click","2024-01-01T00:00:00Z",{"x":1}]"#
        );
        assert_eq!(
            fingerprint("svc-a", "click", &timestamp, &payload).unwrap(),
            "ae205f52e69b4b8d82b1efa4deadb17eff3346c4208dc43df513834071234583"
        );
    }

    #[test]
    fn is_independent_of_key_order() {
        let timestamp = datetime!(2024-03-05 10:15:30.25 UTC);
        let first = parse_payload(r#"{"b": {"z": true, "a": null}, "a": [1, "two", 2.5], "c": "x"}"#);
        let second = parse_payload(r#"{"c": "x", "a": [1, "two", 2.5], "b": {"a": null, "z": true}}"#);

        let one = fingerprint("svc-a", "click", &timestamp, &first).unwrap();
        let two = fingerprint("svc-a", "click", &timestamp, &second).unwrap();
        let again = fingerprint("svc-a", "click", &timestamp, &first).unwrap();

        assert_eq!(one, two);
        assert_eq!(one, again);
        assert_eq!(one.len(), 64);
        assert!(one.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn same_instant_in_other_offset_hashes_the_same() {
        let payload = parse_payload(r#"{"x": 1}"#);

        assert_eq!(
            fingerprint("svc-a", "click", &datetime!(2024-01-01 0:00 UTC), &payload).unwrap(),
            fingerprint("svc-a", "click", &datetime!(2024-01-01 5:30 +5:30), &payload).unwrap(),
        );
    }

    #[test]
    fn every_input_field_changes_the_identity() {
        let timestamp = datetime!(2024-01-01 0:00 UTC);
        let payload = parse_payload(r#"{"x": 1}"#);
        let base = fingerprint("svc-a", "click", &timestamp, &payload).unwrap();

        let variants = [
            fingerprint("svc-b", "click", &timestamp, &payload).unwrap(),
            fingerprint("svc-a", "view", &timestamp, &payload).unwrap(),
            fingerprint("svc-a", "click", &datetime!(2024-01-01 0:00:00.001 UTC), &payload)
                .unwrap(),
            fingerprint("svc-a", "click", &timestamp, &parse_payload(r#"{"x": 2}"#)).unwrap(),
            fingerprint("svc-a", "click", &timestamp, &parse_payload(r#"{"y": 1}"#)).unwrap(),
            fingerprint("svc-a", "click", &timestamp, &parse_payload(r#"{"x": "1"}"#)).unwrap(),
        ];

        for variant in &variants {
            assert_ne!(&base, variant);
        }
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let timestamp = datetime!(2024-01-01 0:00 UTC);
        let payload = parse_payload(r#"{"x": 1}"#);

        assert_ne!(
            fingerprint("svc:a", "click", &timestamp, &payload).unwrap(),
            fingerprint("svc", "a:click", &timestamp, &payload).unwrap(),
        );
    }

    #[test]
    fn assigns_once_and_verifies() {
        let mut event = Event::at(
            "svc-a",
            "click",
            datetime!(2024-01-01 0:00 UTC),
            parse_payload(r#"{"x": 1}"#),
        )
        .unwrap();
        assert!(!verify(&event));

        let first = assign(&mut event).unwrap().to_owned();
        let second = assign(&mut event).unwrap().to_owned();

        assert_eq!(first, second);
        assert_eq!(event.identity(), Some(first.as_str()));
        assert!(verify(&event));
    }

    #[test]
    fn keeps_identity_carried_over_the_wire() {
        let mut event = Event::from_slice(
            br#"{"source": "svc-a", "event_type": "click", "timestamp": "2024-01-01T00:00:00Z", "payload": {"x": 1}, "identity": "upstream"}"#,
        )
        .unwrap();

        assert_eq!(assign(&mut event).unwrap(), "upstream");
        assert!(!verify(&event));
    }

    #[test]
    fn integers_above_i64_keep_their_exact_value() {
        let max = parse_payload(r#"{"n":18446744073709551615}"#);
        let below = parse_payload(r#"{"n":18446744073709551614}"#);
        let timestamp = datetime!(2024-01-01 0:00 UTC);

        assert_eq!(max["n"], PayloadValue::UInt(u64::MAX));
        assert_ne!(
            fingerprint("svc-a", "click", &timestamp, &max).unwrap(),
            fingerprint("svc-a", "click", &timestamp, &below).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&max).unwrap(),
            r#"{"n":18446744073709551615}"#
        );
        assert_eq!(
            serde_json::to_string(&below).unwrap(),
            r#"{"n":18446744073709551614}"#
        );
        assert_eq!(PayloadValue::from(7_u64), PayloadValue::Int(7));
    }
}
