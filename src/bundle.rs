//! Claim-bundle artifact: the unit of attestation a village ingests.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto::{self, CryptoError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use time::OffsetDateTime;

/// One attested edge in the claim graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// The issuing identity (a stable string, distinct from the signing key).
    pub issuer: String,
    /// The edge's source entity.
    pub subject: String,
    /// The predicate/relation name, checked against `allowed_predicates`.
    pub predicate: String,
    /// The edge's target entity, if the predicate is binary.
    #[serde(default)]
    pub object: Option<String>,
    /// A scalar or structured value attached to the claim (edge weight, etc.).
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// How many days of observation this claim covers.
    pub window_days: u64,
    /// When the claim's value was computed.
    #[serde(with = "timestamp")]
    pub computed_at: OffsetDateTime,
    /// Free-text note on how `value` was derived.
    #[serde(default)]
    pub derivation: Option<String>,
    /// Supporting evidence references.
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// A signed collection of claims admitted or rejected as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimBundle {
    /// First 32 hex chars of `sha256_hex(C(payload))`.
    pub bundle_id: String,
    /// The bundle's issuer identity.
    pub issuer: String,
    /// Bundle creation time.
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    /// The observation window every claim in the bundle shares.
    pub window_days: u64,
    /// The claims themselves.
    pub claims: Vec<Claim>,
    /// Always `Ed25519`.
    #[serde(default = "default_alg")]
    pub signature_alg: String,
    /// Base64 Ed25519 public key, once signed.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Base64 Ed25519 signature, once signed.
    #[serde(default)]
    pub signature: Option<String>,
}

fn default_alg() -> String {
    "Ed25519".to_string()
}

/// The bundle with `bundle_id`/`public_key`/`signature` stripped — what's
/// hashed for `bundle_id` and what's signed. `bundle_id` itself must be
/// excluded: it is the hash's own output field, and including it would make
/// the hash depend on what it's computing.
pub fn bundle_payload_for_signing(bundle: &ClaimBundle) -> serde_json::Value {
    let mut value = serde_json::to_value(bundle).expect("ClaimBundle always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("bundle_id");
        obj.remove("public_key");
        obj.remove("signature");
    }
    value
}

/// First 32 hex chars of `sha256_hex(C(payload))`.
pub fn compute_bundle_id(payload: &serde_json::Value) -> String {
    let full = sha256_hex(&canonical_json(payload));
    full[..32].to_string()
}

/// Builds an unsigned bundle with `bundle_id` computed from its content.
pub fn build(issuer: &str, created_at: OffsetDateTime, window_days: u64, claims: Vec<Claim>) -> ClaimBundle {
    let mut bundle = ClaimBundle {
        bundle_id: String::new(),
        issuer: issuer.to_string(),
        created_at,
        window_days,
        claims,
        signature_alg: default_alg(),
        public_key: None,
        signature: None,
    };
    let payload = bundle_payload_for_signing(&bundle);
    bundle.bundle_id = compute_bundle_id(&payload);
    bundle
}

/// Signs `bundle`, overwriting `public_key`/`signature`. `bundle_id` is left
/// untouched (it is computed over content, not over signature fields).
pub fn sign_bundle(mut bundle: ClaimBundle, signing_key: &ed25519_dalek::SigningKey) -> ClaimBundle {
    let payload = bundle_payload_for_signing(&bundle);
    let signature = crypto::sign_payload(signing_key, &canonical_json(&payload));
    bundle.public_key = Some(crypto::encode_public_key_base64(&signing_key.verifying_key()));
    bundle.signature = Some(crypto::encode_signature_base64(&signature));
    bundle
}

/// True iff `bundle` carries a signature, its `bundle_id` matches its
/// content, and the signature verifies over the signing payload. Malformed
/// signature material never leaks through: it's treated as not verifying.
pub fn verify_bundle(bundle: &ClaimBundle) -> bool {
    let (public_key, signature) = match (&bundle.public_key, &bundle.signature) {
        (Some(pk), Some(sig)) => (pk, sig),
        _ => return false,
    };
    let payload = bundle_payload_for_signing(bundle);
    if bundle.bundle_id != compute_bundle_id(&payload) {
        return false;
    }
    crypto::verify_signature_base64(public_key, &canonical_json(&payload), signature).unwrap_or(false)
}

/// Verifies the hash without requiring a signature — used to distinguish
/// "hash mismatch" from "signature missing/invalid" in the admission
/// pipeline's error reporting.
pub fn hash_matches(bundle: &ClaimBundle) -> bool {
    let payload = bundle_payload_for_signing(bundle);
    bundle.bundle_id == compute_bundle_id(&payload)
}

/// Writes `bundle` to `path`, creating parent directories as needed. Callers
/// needing atomicity under concurrent writers should route through
/// [`crate::fslock::atomic_write`] instead when more than one writer is
/// possible for the same path.
pub fn write_bundle(path: &Path, bundle: &ClaimBundle) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(bundle)?;
    crate::fslock::atomic_write(path, &body)
}

/// Reads and parses a stored bundle.
pub fn read_bundle(path: &Path) -> Result<ClaimBundle, crate::error::TrustError> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Decodes `bundle.public_key` and hashes it, for issuer allow/block checks.
pub fn issuer_key_hash(bundle: &ClaimBundle) -> Result<Option<String>, CryptoError> {
    match &bundle.public_key {
        Some(pk) => Ok(Some(crate::canon::key_hash(&crypto::decode_public_key_base64(pk)?.to_bytes()))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn sample_claim() -> Claim {
        Claim {
            issuer: "issuer-1".to_string(),
            subject: "a".to_string(),
            predicate: "links.weighted_to".to_string(),
            object: Some("b".to_string()),
            value: Some(serde_json::json!(1.5)),
            window_days: 30,
            computed_at: ts(0),
            derivation: Some("log(1 + count_30d)".to_string()),
            evidence: Vec::new(),
        }
    }

    #[test]
    fn bundle_id_is_32_hex_chars_and_stable() {
        let bundle = build("issuer-1", ts(0), 30, vec![sample_claim()]);
        assert_eq!(bundle.bundle_id.len(), 32);
        assert!(bundle.bundle_id.chars().all(|c| c.is_ascii_hexdigit()));
        let rebuilt = build("issuer-1", ts(0), 30, vec![sample_claim()]);
        assert_eq!(bundle.bundle_id, rebuilt.bundle_id);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let key = generate_signing_key();
        let bundle = build("issuer-1", ts(0), 30, vec![sample_claim()]);
        let signed = sign_bundle(bundle, &key);
        assert!(verify_bundle(&signed));
    }

    #[test]
    fn unsigned_bundle_does_not_verify() {
        let bundle = build("issuer-1", ts(0), 30, vec![sample_claim()]);
        assert!(!verify_bundle(&bundle));
        assert!(hash_matches(&bundle));
    }

    #[test]
    fn tampering_with_claims_after_signing_breaks_verification() {
        let key = generate_signing_key();
        let bundle = build("issuer-1", ts(0), 30, vec![sample_claim()]);
        let mut signed = sign_bundle(bundle, &key);
        signed.window_days = 999;
        assert!(!verify_bundle(&signed));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let key = generate_signing_key();
        let bundle = sign_bundle(build("issuer-1", ts(0), 30, vec![sample_claim()]), &key);
        let path = dir.path().join("bundles").join(format!("{}.json", bundle.bundle_id));
        write_bundle(&path, &bundle).unwrap();
        let back = read_bundle(&path).unwrap();
        assert_eq!(back.bundle_id, bundle.bundle_id);
        assert!(verify_bundle(&back));
    }
}
