//! Signed denial artifacts: the record left behind when a bundle or policy
//! update is quarantined or rejected.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto;
use crate::fslock::atomic_write;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use time::OffsetDateTime;

/// What kind of artifact a denial concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    /// A claim bundle.
    Bundle,
    /// A policy update.
    PolicyUpdate,
    /// Anything else (e.g. a trust-anchor entry).
    Other,
}

/// A signed record of why something was denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenialArtifact {
    /// Always `village_trust.denial.v1`.
    #[serde(default = "default_format")]
    pub format: String,
    /// When the denial was recorded.
    #[serde(with = "timestamp")]
    pub ts: OffsetDateTime,
    /// The village this denial concerns.
    pub village_id: String,
    /// Who triggered the check that produced this denial, if known.
    #[serde(default)]
    pub actor: Option<String>,
    /// What kind of artifact was denied.
    pub subject_type: SubjectType,
    /// The denied artifact's id (`bundle_id` or `policy_hash`).
    pub subject_id: String,
    /// Human-readable reason, verbatim.
    pub reason: String,
    /// Free-form additional context.
    #[serde(default)]
    pub meta: serde_json::Value,
    /// `sha256_hex(C(artifact with artifact_hash/signature removed))`.
    #[serde(default)]
    pub artifact_hash: String,
    /// Base64 Ed25519 signature, present iff a node key was configured.
    #[serde(default)]
    pub signature: Option<String>,
}

fn default_format() -> String {
    "village_trust.denial.v1".to_string()
}

fn payload_for_hashing(artifact: &DenialArtifact) -> serde_json::Value {
    let mut value = serde_json::to_value(artifact).expect("DenialArtifact always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("artifact_hash");
        obj.remove("signature");
    }
    value
}

/// Builds a denial artifact, hashing it and signing it if `signing_key` is
/// given. Absence of a node key disables the signature without failing the
/// operation.
pub fn build(
    village_id: &str,
    subject_type: SubjectType,
    subject_id: &str,
    reason: &str,
    actor: Option<&str>,
    meta: serde_json::Value,
    signing_key: Option<&SigningKey>,
    ts: OffsetDateTime,
) -> DenialArtifact {
    let mut artifact = DenialArtifact {
        format: default_format(),
        ts,
        village_id: village_id.to_string(),
        actor: actor.map(String::from),
        subject_type,
        subject_id: subject_id.to_string(),
        reason: reason.to_string(),
        meta,
        artifact_hash: String::new(),
        signature: None,
    };
    let payload = canonical_json(&payload_for_hashing(&artifact));
    artifact.artifact_hash = sha256_hex(&payload);
    if let Some(key) = signing_key {
        let signature = crypto::sign_payload(key, &payload);
        artifact.signature = Some(crypto::encode_signature_base64(&signature));
    }
    artifact
}

/// Writes `artifact` to `path` atomically.
pub fn write(path: &Path, artifact: &DenialArtifact) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(artifact)?;
    atomic_write(path, &body)
}

/// True iff `artifact.artifact_hash` matches its own content.
pub fn hash_matches(artifact: &DenialArtifact) -> bool {
    let payload = canonical_json(&payload_for_hashing(artifact));
    artifact.artifact_hash == sha256_hex(&payload)
}

/// Verifies `artifact`'s signature against `public_key_b64`, if one is
/// present; an unsigned artifact (no node key was configured) always
/// verifies its hash but reports `false` for signature presence.
pub fn verify(artifact: &DenialArtifact, public_key_b64: &str) -> bool {
    if !hash_matches(artifact) {
        return false;
    }
    let signature = match &artifact.signature {
        Some(sig) => sig,
        None => return false,
    };
    let payload = canonical_json(&payload_for_hashing(artifact));
    crypto::verify_signature_base64(public_key_b64, &payload, signature).unwrap_or(false)
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
    fn signed_artifact_hash_and_signature_both_verify() {
        let key = generate_signing_key();
        let artifact = build(
            "v1",
            SubjectType::Bundle,
            "abc123",
            "bundle window_days=60 exceeds max_window_days=30",
            None,
            serde_json::json!({}),
            Some(&key),
            ts(0),
        );
        assert!(hash_matches(&artifact));
        let pk = crypto::encode_public_key_base64(&key.verifying_key());
        assert!(verify(&artifact, &pk));
    }

    #[test]
    fn unsigned_artifact_still_hashes_but_never_verifies() {
        let artifact = build(
            "v1",
            SubjectType::PolicyUpdate,
            "policyhash",
            "quorum not met",
            None,
            serde_json::json!({}),
            None,
            ts(0),
        );
        assert!(hash_matches(&artifact));
        assert!(artifact.signature.is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let artifact = build(
            "v1",
            SubjectType::Bundle,
            "abc123",
            "replay detected",
            Some("node"),
            serde_json::json!({"k": "v"}),
            None,
            ts(0),
        );
        let path = dir.path().join("abc123.denial.json");
        write(&path, &artifact).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let back: DenialArtifact = serde_json::from_str(&text).unwrap();
        assert_eq!(back.artifact_hash, artifact.artifact_hash);
    }
}
