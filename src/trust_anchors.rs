//! Per-village trust-anchor registry: register/rotate/revoke entries,
//! multisig over each entry, and the derived active-anchor set.

use crate::canon::{canonical_json, timestamp};
use crate::crypto::{self, CryptoError};
use crate::fslock::atomic_write;
use crate::policy_update::SignatureEntry;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// What a trust-anchor entry does to the village's active-anchor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorAction {
    /// Adds a new anchor.
    Register,
    /// Replaces an anchor's key material, keeping the same `anchor_id`.
    Rotate,
    /// Removes an anchor from the active set.
    Revoke,
}

/// One append-only entry in a village's trust-anchor log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchorEntry {
    /// The village this anchor belongs to.
    pub village_id: String,
    /// Entry creation time.
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    /// Who produced the entry.
    #[serde(default)]
    pub actor: Option<String>,
    /// Which action this entry performs.
    pub action: AnchorAction,
    /// The anchor's stable identifier.
    pub anchor_id: String,
    /// Base64 Ed25519 public key, present on register/rotate.
    #[serde(default)]
    pub anchor_public_key: Option<String>,
    /// `sha256_hex(anchor_public_key bytes)`, present when the key is known.
    #[serde(default)]
    pub anchor_key_hash: Option<String>,
    /// The key hash being replaced, on rotate.
    #[serde(default)]
    pub previous_anchor_key_hash: Option<String>,
    /// Free-text reason, mainly used on revoke.
    #[serde(default)]
    pub reason: Option<String>,
    /// Always `Ed25519`.
    #[serde(default = "default_alg")]
    pub signature_alg: String,
    /// Multisig signatures over this entry.
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

fn default_alg() -> String {
    "Ed25519".to_string()
}

fn payload_for_signing(entry: &TrustAnchorEntry) -> serde_json::Value {
    let mut value = serde_json::to_value(entry).expect("TrustAnchorEntry always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signatures");
    }
    value
}

/// Appends a signature, de-duplicated by signer key-hash.
pub fn add_anchor_signature(mut entry: TrustAnchorEntry, signing_key: &SigningKey) -> TrustAnchorEntry {
    let payload = canonical_json(&payload_for_signing(&entry));
    let signature = crypto::sign_payload(signing_key, &payload);
    let public_key = crypto::encode_public_key_base64(&signing_key.verifying_key());
    let new_key_hash = crate::canon::key_hash(&signing_key.verifying_key().to_bytes());

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for s in entry.signatures.drain(..) {
        let kh = crypto::decode_public_key_base64(&s.public_key)
            .map(|vk| crate::canon::key_hash(&vk.to_bytes()))
            .unwrap_or_default();
        if !seen.insert(kh) {
            continue;
        }
        out.push(s);
    }
    if !seen.contains(&new_key_hash) {
        out.push(SignatureEntry {
            public_key,
            signature: crypto::encode_signature_base64(&signature),
        });
    }
    entry.signatures = out;
    entry
}

/// True iff at least one signature over `entry` verifies. Malformed
/// signature material never leaks through: it's treated as not verifying.
pub fn verify_anchor_entry_any(entry: &TrustAnchorEntry) -> bool {
    if entry.signatures.is_empty() {
        return false;
    }
    let payload = canonical_json(&payload_for_signing(entry));
    entry
        .signatures
        .iter()
        .any(|s| crypto::verify_signature_base64(&s.public_key, &payload, &s.signature).unwrap_or(false))
}

fn anchors_dir(villages_root: &Path, village_id: &str) -> PathBuf {
    villages_root.join("villages").join(village_id).join("trust_anchors")
}

fn file_name_for(entry: &TrustAnchorEntry) -> String {
    let ts = timestamp::to_iso_z(entry.created_at).replace(':', "").replace('-', "");
    let action = match entry.action {
        AnchorAction::Register => "register",
        AnchorAction::Rotate => "rotate",
        AnchorAction::Revoke => "revoke",
    };
    let key_hash = entry.anchor_key_hash.as_deref().unwrap_or("na");
    format!("{ts}.{action}.{key_hash}.json")
}

/// Appends `entry` to its village's trust-anchor log.
pub fn store(villages_root: &Path, entry: &TrustAnchorEntry) -> io::Result<PathBuf> {
    let dir = anchors_dir(villages_root, &entry.village_id);
    fs::create_dir_all(&dir)?;
    let path = dir.join(file_name_for(entry));
    let body = serde_json::to_vec_pretty(entry)?;
    atomic_write(&path, &body)?;
    Ok(path)
}

/// Reads every trust-anchor entry for `village_id`, sorted by
/// `(created_at, anchor_key_hash)`.
pub fn iter(villages_root: &Path, village_id: &str) -> io::Result<Vec<TrustAnchorEntry>> {
    let dir = anchors_dir(villages_root, village_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(entry) = serde_json::from_str::<TrustAnchorEntry>(&text) {
                out.push(entry);
            }
        }
    }
    out.sort_by(|a, b| {
        (a.created_at, a.anchor_key_hash.as_deref().unwrap_or(""))
            .cmp(&(b.created_at, b.anchor_key_hash.as_deref().unwrap_or("")))
    });
    Ok(out)
}

/// Applies register/rotate/revoke in order and returns the most recently
/// created entry still in the active set, if any.
pub fn latest_active(villages_root: &Path, village_id: &str) -> io::Result<Option<TrustAnchorEntry>> {
    let entries = iter(villages_root, village_id)?;
    let mut active: HashMap<String, TrustAnchorEntry> = HashMap::new();
    for entry in entries {
        match entry.action {
            AnchorAction::Register | AnchorAction::Rotate => {
                if let Some(kh) = &entry.anchor_key_hash {
                    active.insert(kh.clone(), entry);
                }
            }
            AnchorAction::Revoke => {
                if let Some(kh) = &entry.anchor_key_hash {
                    active.remove(kh);
                }
            }
        }
    }
    Ok(active.into_values().max_by_key(|e| e.created_at))
}

/// Decodes and hashes `public_key_b64`, for constructing register/rotate
/// entries from key material.
pub fn key_hash_of(public_key_b64: &str) -> Result<String, CryptoError> {
    let vk = crypto::decode_public_key_base64(public_key_b64)?;
    Ok(crate::canon::key_hash(&vk.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn register(anchor_id: &str, secs: i64, key_hash: &str) -> TrustAnchorEntry {
        TrustAnchorEntry {
            village_id: "v1".to_string(),
            created_at: ts(secs),
            actor: None,
            action: AnchorAction::Register,
            anchor_id: anchor_id.to_string(),
            anchor_public_key: None,
            anchor_key_hash: Some(key_hash.to_string()),
            previous_anchor_key_hash: None,
            reason: None,
            signature_alg: default_alg(),
            signatures: Vec::new(),
        }
    }

    #[test]
    fn signature_round_trips_and_dedups() {
        let key = generate_signing_key();
        let entry = register("a1", 0, "deadbeef");
        let signed = add_anchor_signature(entry, &key);
        assert!(verify_anchor_entry_any(&signed));
        let signed_twice = add_anchor_signature(signed, &key);
        assert_eq!(signed_twice.signatures.len(), 1);
    }

    #[test]
    fn unsigned_entry_does_not_verify() {
        let entry = register("a1", 0, "deadbeef");
        assert!(!verify_anchor_entry_any(&entry));
    }

    #[test]
    fn register_then_revoke_leaves_no_active_anchor() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let key_hash = crate::canon::key_hash(&key.verifying_key().to_bytes());
        let reg = add_anchor_signature(register("a1", 0, &key_hash), &key);
        store(dir.path(), &reg).unwrap();

        let revoke = TrustAnchorEntry {
            action: AnchorAction::Revoke,
            created_at: ts(10),
            reason: Some("compromised".to_string()),
            ..register("a1", 10, &key_hash)
        };
        let revoke = add_anchor_signature(revoke, &key);
        store(dir.path(), &revoke).unwrap();

        assert!(latest_active(dir.path(), "v1").unwrap().is_none());
    }

    #[test]
    fn rotate_replaces_active_anchor_under_same_id() {
        let dir = tempdir().unwrap();
        let old_key = generate_signing_key();
        let new_key = generate_signing_key();
        let old_hash = crate::canon::key_hash(&old_key.verifying_key().to_bytes());
        let new_hash = crate::canon::key_hash(&new_key.verifying_key().to_bytes());

        store(dir.path(), &add_anchor_signature(register("a1", 0, &old_hash), &old_key)).unwrap();

        let rotate = TrustAnchorEntry {
            action: AnchorAction::Rotate,
            created_at: ts(5),
            previous_anchor_key_hash: Some(old_hash),
            ..register("a1", 5, &new_hash)
        };
        store(dir.path(), &add_anchor_signature(rotate, &new_key)).unwrap();

        let active = latest_active(dir.path(), "v1").unwrap().unwrap();
        assert_eq!(active.anchor_key_hash, Some(new_hash));
    }
}
