//! Hash-chained audit records.
//!
//! Every record carries the hash of its predecessor, so truncating, editing,
//! or reordering the log breaks the chain at the first touched record. The
//! canonical encoding hashed is the JSON serialization of
//! `{timestamp, type, data}` in that field order.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first record in every chain.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// ISO-8601 UTC timestamp (RFC 3339).
    pub timestamp: String,
    /// Event type; the proxy emits `credential_access`, other producers may
    /// append their own shapes.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload, opaque to the chain.
    pub data: serde_json::Value,
    /// Hash of the preceding record, or [`ZERO_HASH`] for the first.
    pub prev_hash: String,
    /// `SHA-256(prev_hash || canonical({timestamp, type, data}))`, hex.
    pub hash: String,
}

/// The hashed portion of a record, in canonical field order.
#[derive(Serialize)]
struct CanonicalBody<'a> {
    timestamp: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    data: &'a serde_json::Value,
}

fn canonical_body(timestamp: &str, event_type: &str, data: &serde_json::Value) -> String {
    serde_json::to_string(&CanonicalBody { timestamp, event_type, data })
        .expect("audit body serialization cannot fail")
}

/// Compute a record hash from its predecessor's hash and its body fields.
pub fn chain_hash(prev_hash: &str, timestamp: &str, event_type: &str, data: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_body(timestamp, event_type, data).as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        write!(out, "{b:02x}").expect("writing to String cannot fail");
    }
    out
}

impl AuditRecord {
    /// Build the next record in a chain.
    pub fn next(prev_hash: &str, event_type: &str, data: serde_json::Value) -> Self {
        let timestamp = Utc::now().to_rfc3339();
        let hash = chain_hash(prev_hash, &timestamp, event_type, &data);
        Self {
            timestamp,
            event_type: event_type.to_string(),
            data,
            prev_hash: prev_hash.to_string(),
            hash,
        }
    }

    /// Recompute this record's hash from its stored fields.
    pub fn expected_hash(&self) -> String {
        chain_hash(&self.prev_hash, &self.timestamp, &self.event_type, &self.data)
    }

    /// Serialize to one JSONL line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).expect("audit record serialization cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hash_is_64_zeroes() {
        assert_eq!(ZERO_HASH.len(), 64);
        assert!(ZERO_HASH.chars().all(|c| c == '0'));
    }

    #[test]
    fn first_record_chains_from_zero() {
        let rec = AuditRecord::next(ZERO_HASH, "credential_access", serde_json::json!({"service": "openai"}));
        assert_eq!(rec.prev_hash, ZERO_HASH);
        assert_eq!(rec.hash, rec.expected_hash());
        assert_eq!(rec.hash.len(), 64);
    }

    #[test]
    fn chain_links_records() {
        let first = AuditRecord::next(ZERO_HASH, "credential_access", serde_json::json!({"n": 1}));
        let second = AuditRecord::next(&first.hash, "credential_access", serde_json::json!({"n": 2}));
        assert_eq!(second.prev_hash, first.hash);
        assert_ne!(second.hash, first.hash);
    }

    #[test]
    fn hash_depends_on_every_body_field() {
        let data = serde_json::json!({"service": "openai"});
        let base = chain_hash(ZERO_HASH, "2026-01-01T00:00:00Z", "credential_access", &data);
        assert_ne!(base, chain_hash(ZERO_HASH, "2026-01-01T00:00:01Z", "credential_access", &data));
        assert_ne!(base, chain_hash(ZERO_HASH, "2026-01-01T00:00:00Z", "tool_call", &data));
        assert_ne!(
            base,
            chain_hash(
                ZERO_HASH,
                "2026-01-01T00:00:00Z",
                "credential_access",
                &serde_json::json!({"service": "anthropic"})
            )
        );
    }

    #[test]
    fn tampered_data_is_detected_by_expected_hash() {
        let mut rec = AuditRecord::next(ZERO_HASH, "credential_access", serde_json::json!({"ok": true}));
        rec.data = serde_json::json!({"ok": false});
        assert_ne!(rec.hash, rec.expected_hash());
    }

    #[test]
    fn json_line_roundtrips() {
        let rec = AuditRecord::next(ZERO_HASH, "credential_access", serde_json::json!({"service": "slack"}));
        let parsed: AuditRecord = serde_json::from_str(&rec.to_json_line()).unwrap();
        assert_eq!(parsed.hash, rec.hash);
        assert_eq!(parsed.event_type, "credential_access");
    }

    #[test]
    fn type_field_serializes_as_type() {
        let rec = AuditRecord::next(ZERO_HASH, "credential_access", serde_json::json!({}));
        let value: serde_json::Value = serde_json::from_str(&rec.to_json_line()).unwrap();
        assert_eq!(value["type"], "credential_access");
        assert!(value.get("event_type").is_none());
    }
}
