//! Per-village signed transparency log: one append-only NDJSON file
//! recording every policy hash this node has applied, each entry
//! self-certifying via its own `entry_hash`.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto;
use crate::fslock::append_line_locked;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// One row of a village's `policy_log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyEntry {
    /// When this entry was recorded.
    #[serde(with = "timestamp")]
    pub ts: OffsetDateTime,
    /// The village this entry concerns.
    pub village_id: String,
    /// The policy hash being recorded.
    pub policy_hash: String,
    /// The update hash, if this entry records a specific update.
    #[serde(default)]
    pub update_hash: Option<String>,
    /// Free-form additional context.
    #[serde(default)]
    pub meta: serde_json::Value,
    /// `sha256_hex(C(entry with entry_hash/signature removed))`.
    #[serde(default)]
    pub entry_hash: String,
    /// Base64 Ed25519 signature over the same stripped payload.
    #[serde(default)]
    pub signature: String,
}

fn payload_for_hashing(entry: &TransparencyEntry) -> serde_json::Value {
    let mut value = serde_json::to_value(entry).expect("TransparencyEntry always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("entry_hash");
        obj.remove("signature");
    }
    value
}

fn log_path(store_root: &Path, village_id: &str) -> PathBuf {
    store_root.join("transparency").join(village_id).join("policy_log.jsonl")
}

/// Builds, signs, and appends a transparency entry; returns the entry as
/// stored.
pub fn append_entry(
    store_root: &Path,
    village_id: &str,
    policy_hash: &str,
    update_hash: Option<&str>,
    meta: serde_json::Value,
    signing_key: &SigningKey,
    ts: OffsetDateTime,
) -> io::Result<TransparencyEntry> {
    let mut entry = TransparencyEntry {
        ts,
        village_id: village_id.to_string(),
        policy_hash: policy_hash.to_string(),
        update_hash: update_hash.map(String::from),
        meta,
        entry_hash: String::new(),
        signature: String::new(),
    };
    let payload = canonical_json(&payload_for_hashing(&entry));
    entry.entry_hash = sha256_hex(&payload);
    let signature = crypto::sign_payload(signing_key, &payload);
    entry.signature = crypto::encode_signature_base64(&signature);

    let line = serde_json::to_string(&entry)?;
    append_line_locked(&log_path(store_root, village_id), &line)?;
    Ok(entry)
}

/// True iff `entry.entry_hash` matches its own content. Does not verify the
/// signature (the caller supplies the node's public key for that, since this
/// log has no per-entry key material beyond the shared node signature).
pub fn entry_hash_matches(entry: &TransparencyEntry) -> bool {
    let payload = canonical_json(&payload_for_hashing(entry));
    entry.entry_hash == sha256_hex(&payload)
}

/// Verifies `entry`'s signature against `public_key_b64`, as well as its
/// self-certifying `entry_hash`.
pub fn verify_entry(entry: &TransparencyEntry, public_key_b64: &str) -> bool {
    if !entry_hash_matches(entry) {
        return false;
    }
    let payload = canonical_json(&payload_for_hashing(entry));
    crypto::verify_signature_base64(public_key_b64, &payload, &entry.signature).unwrap_or(false)
}

/// Reads the last `limit` entries for `village_id` (streamed NDJSON tail, per
/// the `/transparency/policy_log?limit=` endpoint).
pub fn tail(store_root: &Path, village_id: &str, limit: usize) -> io::Result<Vec<TransparencyEntry>> {
    let path = log_path(store_root, village_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)?;
    let entries: Vec<TransparencyEntry> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    let limit = limit.clamp(1, 5000);
    let start = entries.len().saturating_sub(limit);
    Ok(entries[start..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    #[test]
    fn appended_entry_self_certifies_and_verifies() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let entry = append_entry(
            dir.path(),
            "v1",
            "deadbeef",
            Some("cafebabe"),
            serde_json::json!({}),
            &key,
            ts(0),
        )
        .unwrap();
        assert!(entry_hash_matches(&entry));
        let pk = crypto::encode_public_key_base64(&key.verifying_key());
        assert!(verify_entry(&entry, &pk));
    }

    #[test]
    fn tampered_entry_fails_hash_check() {
        let key = generate_signing_key();
        let mut entry = TransparencyEntry {
            ts: ts(0),
            village_id: "v1".to_string(),
            policy_hash: "deadbeef".to_string(),
            update_hash: None,
            meta: serde_json::json!({}),
            entry_hash: String::new(),
            signature: String::new(),
        };
        let payload = canonical_json(&payload_for_hashing(&entry));
        entry.entry_hash = sha256_hex(&payload);
        entry.signature = crypto::encode_signature_base64(&crypto::sign_payload(&key, &payload));

        entry.policy_hash = "tampered".to_string();
        assert!(!entry_hash_matches(&entry));
    }

    #[test]
    fn tail_returns_last_n_entries_in_order() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        for i in 0..5 {
            append_entry(dir.path(), "v1", &format!("hash-{i}"), None, serde_json::json!({}), &key, ts(i))
                .unwrap();
        }
        let last_two = tail(dir.path(), "v1", 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].policy_hash, "hash-3");
        assert_eq!(last_two[1].policy_hash, "hash-4");
    }
}
