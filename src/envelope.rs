//! Event envelope and its JSON wire codec.
//!
//! The envelope is the unit of work moved through every transport. Its wire form is a JSON
//! object:
//!
//! ```text
//! { "id": "...", "type": "...", "key": "...", "attempts": 0,
//!   "created_at": "2024-01-01T00:00:00.000000000Z", "payload": { "k": "v" } }
//! ```
//!
//! `id` and `created_at` are fixed at construction. `attempts` is the only mutable field and
//! only moves forward through [`Envelope::record_attempt`].
//!
//! ```rust
//! use brokerlab::envelope::{decode, Envelope};
//!
//! let event = Envelope::new("UserUpdated", "user-1", [("i".to_string(), "1".to_string())]);
//! let bytes = event.encode();
//! assert_eq!(decode(&bytes).unwrap(), event);
//! assert!(decode(b"{not-json").is_err());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unit of work carried by every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    key: String,
    attempts: u32,
    created_at: DateTime<Utc>,
    payload: BTreeMap<String, String>,
}

/// Raised when bytes cannot be decoded into an [`Envelope`].
///
/// Terminal: a poison message is finalized without redelivery or dead-lettering.
#[derive(Debug, thiserror::Error)]
#[error("poison message ({len} bytes): {source}")]
pub struct PoisonMessage {
    len: usize,
    #[source]
    source: serde_json::Error,
}

impl PoisonMessage {
    /// Size of the rejected payload in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the rejected payload was empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Human-readable reason reported by the decoder.
    pub fn reason(&self) -> String {
        self.source.to_string()
    }
}

impl Envelope {
    /// Create a fresh envelope: new UUIDv4 id, zero attempts, current UTC time.
    pub fn new<I>(event_type: impl Into<String>, key: impl Into<String>, payload: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            key: key.into(),
            attempts: 0,
            created_at: Utc::now(),
            payload: payload.into_iter().collect(),
        }
    }

    /// Override the starting attempt count. Used when replaying events captured elsewhere.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Routing / partition affinity key. Preserved byte-for-byte across retries.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }

    /// Count one classification of this event and return the new attempt count.
    ///
    /// `prior_deliveries` is the number of times the transport already handed out the same
    /// physical message without the payload being rewritten; it is zero for transports that
    /// republish a copy carrying the counter.
    pub fn record_attempt(&mut self, prior_deliveries: u32) -> u32 {
        self.attempts = self.attempts.saturating_add(prior_deliveries).saturating_add(1);
        self.attempts
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Vec<u8> {
        // Strings, an integer, a timestamp and a string map always serialize.
        serde_json::to_vec(self).expect("envelope serialization is infallible")
    }
}

/// Serialize an envelope to bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    envelope.encode()
}

/// Decode bytes into an envelope, or report them as poison.
pub fn decode(bytes: &[u8]) -> Result<Envelope, PoisonMessage> {
    serde_json::from_slice(bytes).map_err(|source| PoisonMessage { len: bytes.len(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> Envelope {
        Envelope::new(
            "UserUpdated",
            "user-1",
            [("i".to_string(), "2024-05-01T10:00:00.123456789Z".to_string())],
        )
    }

    #[test]
    fn new_envelope_starts_at_zero_attempts() {
        let e = sample();
        assert_eq!(e.attempts(), 0);
        assert_eq!(e.event_type(), "UserUpdated");
        assert_eq!(e.key(), "user-1");
        assert!(Uuid::parse_str(e.id()).is_ok());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(sample().id(), sample().id());
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let e = sample().with_attempts(3);
        let decoded = decode(&e.encode()).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(decoded.created_at(), e.created_at());
    }

    #[test]
    fn wire_format_uses_type_field() {
        let e = sample();
        let v: serde_json::Value = serde_json::from_slice(&e.encode()).unwrap();
        assert_eq!(v["type"], "UserUpdated");
        assert_eq!(v["key"], "user-1");
        assert_eq!(v["attempts"], 0);
        assert!(v["created_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(v["payload"]["i"], "2024-05-01T10:00:00.123456789Z");
    }

    #[test]
    fn decodes_hand_written_event() {
        let raw = br#"{"id":"abc","type":"UserUpdated","key":"user-2","attempts":4,
            "created_at":"2024-05-01T10:00:00Z","payload":{}}"#;
        let e = decode(raw).unwrap();
        assert_eq!(e.id(), "abc");
        assert_eq!(e.attempts(), 4);
        assert!(e.payload().is_empty());
    }

    #[test]
    fn malformed_json_is_poison() {
        let err = decode(b"{not-json").unwrap_err();
        assert_eq!(err.len(), 9);
        assert!(err.to_string().contains("poison"));
    }

    #[test]
    fn schema_mismatch_is_poison() {
        assert!(decode(br#"{"id":"abc"}"#).is_err());
        assert!(decode(
            br#"{"id":"a","type":"t","key":"k","attempts":-1,"created_at":"2024-05-01T10:00:00Z","payload":{}}"#
        )
        .is_err());
        assert!(decode(
            br#"{"id":"a","type":"t","key":"k","attempts":0,"created_at":"yesterday","payload":{}}"#
        )
        .is_err());
        assert!(decode(
            br#"{"id":"a","type":"t","key":"k","attempts":0,"created_at":"2024-05-01T10:00:00Z","payload":{"n":1}}"#
        )
        .is_err());
        assert!(decode(
            br#"{"id":"a","type":"t","key":"k","attempts":0,"created_at":"2024-05-01T10:00:00Z","payload":{},"extra":true}"#
        )
        .is_err());
    }

    #[test]
    fn invalid_utf8_is_poison() {
        assert!(decode(&[0xff, 0xfe, 0xfd]).is_err());
        assert!(decode(&[]).unwrap_err().is_empty());
    }

    #[test]
    fn record_attempt_is_monotonic() {
        let mut e = sample();
        assert_eq!(e.record_attempt(0), 1);
        assert_eq!(e.record_attempt(0), 2);
        assert_eq!(e.record_attempt(2), 5);
        let id = e.id().to_string();
        let created = e.created_at();
        assert_eq!(e.id(), id);
        assert_eq!(e.created_at(), created);
    }

    #[test]
    fn record_attempt_saturates() {
        let mut e = sample().with_attempts(u32::MAX - 1);
        assert_eq!(e.record_attempt(10), u32::MAX);
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }

        #[test]
        fn envelope_survives_the_wire(
            event_type in "[A-Za-z][A-Za-z0-9.]{0,23}",
            key in "\\PC{1,24}",
            attempts in any::<u32>(),
            payload in proptest::collection::btree_map("\\PC{0,12}", "\\PC{0,32}", 0..8),
        ) {
            let e = Envelope::new(event_type, key, payload).with_attempts(attempts);
            prop_assert_eq!(decode(&e.encode()).unwrap(), e);
        }
    }
}
