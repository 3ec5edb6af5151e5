//! Per-village append-only log of policy updates: storage, ordered
//! iteration, pagination, and signed feed manifests.
//!
//! Feed manifests are written with the same temp-then-rename atomicity as
//! every other snapshot in this crate, so a reader never sees a half-written
//! manifest.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto::{self, CryptoError};
use crate::fslock::atomic_write;
use crate::merkle::{chain_head_hex, hash_from_hex, merkle_root_hex};
use crate::policy_update::{self, PolicyUpdate};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

fn updates_dir(villages_root: &Path, village_id: &str) -> PathBuf {
    villages_root.join("villages").join(village_id).join("policy_updates")
}

fn file_name_for(update: &PolicyUpdate) -> String {
    let ts = timestamp::to_iso_z(update.created_at)
        .replace(':', "")
        .replace('-', "");
    format!("{ts}.{}.json", update.policy_hash)
}

/// Appends `update` to its village's feed. Idempotent: an update whose
/// `policy_hash` already has a file on disk is a no-op (same file name).
pub fn store(villages_root: &Path, update: &PolicyUpdate) -> io::Result<PathBuf> {
    let dir = updates_dir(villages_root, &update.village_id);
    fs::create_dir_all(&dir)?;
    let path = dir.join(file_name_for(update));
    if path.exists() {
        return Ok(path);
    }
    let body = serde_json::to_vec_pretty(update)?;
    atomic_write(&path, &body)?;
    Ok(path)
}

/// Reads every update stored for `village_id`, skipping any file that fails
/// to parse (a peer running a newer schema wrote something this node can't
/// yet read back).
pub fn iter(villages_root: &Path, village_id: &str) -> io::Result<Vec<PolicyUpdate>> {
    let dir = updates_dir(villages_root, village_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();
    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        if let Ok(text) = fs::read_to_string(&path) {
            if let Ok(update) = serde_json::from_str::<PolicyUpdate>(&text) {
                out.push(update);
            }
        }
    }
    out.sort_by(sort_key);
    Ok(out)
}

fn sort_key(a: &PolicyUpdate, b: &PolicyUpdate) -> std::cmp::Ordering {
    (a.created_at, &a.policy_hash).cmp(&(b.created_at, &b.policy_hash))
}

/// The update maximizing `(created_at, policy_hash)`.
pub fn latest(villages_root: &Path, village_id: &str) -> io::Result<Option<PolicyUpdate>> {
    let mut updates = iter(villages_root, village_id)?;
    Ok(updates.pop())
}

/// All updates strictly after the one with `since_hash`, in sorted order.
/// Returns every update when `since_hash` is absent, and an empty list when
/// `since_hash` isn't found (it names no position in the feed).
pub fn filter_since(
    villages_root: &Path,
    village_id: &str,
    since_hash: Option<&str>,
) -> io::Result<Vec<PolicyUpdate>> {
    let updates = iter(villages_root, village_id)?;
    let since = match since_hash {
        None => return Ok(updates),
        Some(h) => h,
    };
    let mut out = Vec::new();
    let mut seen = false;
    for update in updates {
        if seen {
            out.push(update);
        }
        if update.policy_hash == since {
            seen = true;
        }
    }
    Ok(out)
}

/// One page of a pre-sorted list, keyed on `policy_hash`.
#[derive(Debug, Clone)]
pub struct Page {
    /// The returned items.
    pub items: Vec<PolicyUpdate>,
    /// `policy_hash` of the last returned item, if more items remain.
    pub next_cursor: Option<String>,
}

/// Clamps `limit` to `[1, 500]` and returns the next page after `cursor`
/// (the `policy_hash` of the previous page's last item). Concatenating
/// successive pages starting from `cursor = None` reproduces `list` exactly,
/// with no gaps and no duplicates.
pub fn paginate(list: &[PolicyUpdate], cursor: Option<&str>, limit: usize) -> Page {
    let limit = limit.clamp(1, 500);
    let start = match cursor {
        None => 0,
        Some(c) => list
            .iter()
            .position(|u| u.policy_hash == c)
            .map(|idx| idx + 1)
            .unwrap_or(list.len()),
    };
    let end = (start + limit).min(list.len());
    let items = list[start..end].to_vec();
    let next_cursor = if end < list.len() {
        items.last().map(|u| u.policy_hash.clone())
    } else {
        None
    };
    Page { items, next_cursor }
}

/// One row of [`FeedManifest::items`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestItem {
    /// Update creation time.
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    /// Update's own `policy_hash`.
    pub policy_hash: String,
    /// `update_hash` as used in the Merkle root and hash chain.
    pub update_hash: String,
    /// Predecessor `policy_hash`, if any.
    #[serde(default)]
    pub previous_policy_hash: Option<String>,
    /// Lifecycle state at manifest-build time.
    pub lifecycle_state: policy_update::LifecycleState,
    /// Time gate, if any.
    #[serde(default, with = "timestamp::option")]
    pub activation_time: Option<OffsetDateTime>,
    /// Height gate, if any.
    #[serde(default)]
    pub activation_height: Option<u64>,
}

/// A signed snapshot of a village's policy feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedManifest {
    /// The village this manifest describes.
    pub village_id: String,
    /// When this manifest was built.
    #[serde(with = "timestamp")]
    pub generated_at: OffsetDateTime,
    /// `policy_hash` of the feed's current head, if non-empty.
    #[serde(default)]
    pub head_policy_hash: Option<String>,
    /// Number of items in the feed.
    pub count: usize,
    /// Unbalanced binary Merkle root over `update_hash` values.
    pub merkle_root: String,
    /// Iterated hash chain head over `update_hash` values.
    pub chain_head: String,
    /// Feed entries, in `(created_at, policy_hash)` order.
    pub items: Vec<ManifestItem>,
    /// Base64 Ed25519 public key of the signing node, if signed.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Base64 Ed25519 signature, if signed.
    #[serde(default)]
    pub signature: Option<String>,
}

/// Builds an unsigned manifest for `village_id` from its current feed.
pub fn build_manifest(
    villages_root: &Path,
    village_id: &str,
    generated_at: OffsetDateTime,
) -> io::Result<FeedManifest> {
    let updates = iter(villages_root, village_id)?;
    let items: Vec<ManifestItem> = updates
        .iter()
        .map(|u| ManifestItem {
            created_at: u.created_at,
            policy_hash: u.policy_hash.clone(),
            update_hash: policy_update::compute_update_hash(u),
            previous_policy_hash: u.previous_policy_hash.clone(),
            lifecycle_state: u.lifecycle_state,
            activation_time: u.activation_time,
            activation_height: u.activation_height,
        })
        .collect();
    let leaves: Vec<[u8; 32]> = items
        .iter()
        .filter_map(|item| hash_from_hex(&item.update_hash))
        .collect();
    Ok(FeedManifest {
        village_id: village_id.to_string(),
        generated_at,
        head_policy_hash: updates.last().map(|u| u.policy_hash.clone()),
        count: items.len(),
        merkle_root: merkle_root_hex(&leaves),
        chain_head: chain_head_hex(&leaves),
        items,
        public_key: None,
        signature: None,
    })
}

fn payload_for_signing(manifest: &FeedManifest) -> serde_json::Value {
    let mut value = serde_json::to_value(manifest).expect("FeedManifest always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("public_key");
        obj.remove("signature");
    }
    value
}

/// Signs `manifest` with the node's key.
pub fn sign_manifest(mut manifest: FeedManifest, signing_key: &SigningKey) -> FeedManifest {
    let payload = canonical_json(&payload_for_signing(&manifest));
    let signature = crypto::sign_payload(signing_key, &payload);
    manifest.public_key = Some(crypto::encode_public_key_base64(&signing_key.verifying_key()));
    manifest.signature = Some(crypto::encode_signature_base64(&signature));
    manifest
}

/// Verifies a manifest's signature is present and valid; if `trusted_key_hashes`
/// is given, the signer's key-hash must additionally be in that set.
pub fn verify_manifest(
    manifest: &FeedManifest,
    trusted_key_hashes: Option<&HashSet<String>>,
) -> Result<bool, CryptoError> {
    let (public_key, signature) = match (&manifest.public_key, &manifest.signature) {
        (Some(pk), Some(sig)) => (pk, sig),
        _ => return Ok(false),
    };
    let payload = canonical_json(&payload_for_signing(manifest));
    if !crypto::verify_signature_base64(public_key, &payload, signature)? {
        return Ok(false);
    }
    if let Some(trusted) = trusted_key_hashes {
        let vk = crypto::decode_public_key_base64(public_key)?;
        let key_hash = crate::canon::key_hash(&vk.to_bytes());
        if !trusted.contains(&key_hash) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// `policy` governs whether signatures are required at all, and
/// `signer_allowed` checks `update` against that policy. When a
/// signature is required, dispatches to the quorum verifier the policy
/// names (`policy_quorum`, falling back to m-of-n with `policy_signature_
/// threshold_m` or `1` when unset) rather than just checking for *a* valid
/// signature.
pub fn signer_allowed(policy: &crate::policy::Policy, update: &PolicyUpdate) -> Result<(), crate::error::TrustError> {
    use crate::error::TrustError;
    use crate::policy::QuorumModel;

    let require_sig = policy.require_policy_signature();
    let allow = policy.policy_signer_allowlist();
    let allow_ref = if allow.is_empty() { None } else { Some(&allow) };
    let has_material = update.public_key.is_some() && update.signature.is_some() || !update.signatures.is_empty();

    if require_sig {
        if !has_material {
            return Err(TrustError::InvalidSignature("signature required".to_string()));
        }
        match policy.policy_quorum() {
            Some(quorum) => match quorum.model {
                QuorumModel::MOfN => {
                    let m = quorum.threshold_m.unwrap_or(1);
                    policy_update::verify_m_of_n(update, m, allow_ref)
                }
                QuorumModel::Weighted => {
                    let weights = policy.policy_signer_weights();
                    let required = quorum.threshold_weight.unwrap_or(0.0);
                    policy_update::verify_weighted(update, &weights, required, allow_ref).map(|_| ())
                }
                QuorumModel::RoleBased => {
                    let roles = policy.policy_signer_roles();
                    let requirements: Vec<policy_update::QuorumRoleRequirement> = quorum
                        .role_requirements
                        .iter()
                        .map(|r| policy_update::QuorumRoleRequirement {
                            role: r.role.clone(),
                            min_signers: r.min_signers,
                        })
                        .collect();
                    policy_update::verify_role_based(update, &roles, &requirements, allow_ref).map(|_| ())
                }
            },
            None => {
                let m = policy.policy_signature_threshold_m().unwrap_or(1);
                policy_update::verify_m_of_n(update, m, allow_ref)
            }
        }
    } else if has_material {
        if !policy_update::verify_any(update) {
            return Err(TrustError::InvalidSignature("signature invalid".to_string()));
        }
        if !allow.is_empty() && !any_signer_allowlisted(update, &allow) {
            return Err(TrustError::InvalidSignature("signer not allowlisted".to_string()));
        }
        Ok(())
    } else {
        Ok(())
    }
}

fn any_signer_allowlisted(update: &PolicyUpdate, allow: &HashSet<String>) -> bool {
    let mut key_hashes: Vec<String> = update
        .signatures
        .iter()
        .filter_map(|entry| crypto::decode_public_key_base64(&entry.public_key).ok())
        .map(|vk| crate::canon::key_hash(&vk.to_bytes()))
        .collect();
    if let Some(pk) = &update.public_key {
        if let Ok(vk) = crypto::decode_public_key_base64(pk) {
            key_hashes.push(crate::canon::key_hash(&vk.to_bytes()));
        }
    }
    key_hashes.iter().any(|kh| allow.contains(kh))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;
    use crate::policy::Policy;
    use crate::policy_update::{build, sign_legacy, BuildOptions};
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn update_at(village: &str, secs: i64, window: u64) -> PolicyUpdate {
        let policy = Policy(json!({"visibility": "village", "max_window_days": window}));
        build(village, policy, None, ts(secs), BuildOptions::default())
    }

    #[test]
    fn store_then_iter_round_trips_and_sorts() {
        let dir = tempdir().unwrap();
        let u1 = update_at("v1", 10, 30);
        let u2 = update_at("v1", 5, 60);
        store(dir.path(), &u1).unwrap();
        store(dir.path(), &u2).unwrap();
        let listed = iter(dir.path(), "v1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].policy_hash, u2.policy_hash);
        assert_eq!(listed[1].policy_hash, u1.policy_hash);
    }

    #[test]
    fn store_is_idempotent_on_policy_hash() {
        let dir = tempdir().unwrap();
        let u = update_at("v1", 0, 30);
        let p1 = store(dir.path(), &u).unwrap();
        let p2 = store(dir.path(), &u).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(iter(dir.path(), "v1").unwrap().len(), 1);
    }

    #[test]
    fn latest_picks_max_created_at_then_policy_hash() {
        let dir = tempdir().unwrap();
        store(dir.path(), &update_at("v1", 1, 30)).unwrap();
        let newest = update_at("v1", 99, 45);
        store(dir.path(), &newest).unwrap();
        let got = latest(dir.path(), "v1").unwrap().unwrap();
        assert_eq!(got.policy_hash, newest.policy_hash);
    }

    #[test]
    fn filter_since_excludes_named_hash_and_earlier() {
        let dir = tempdir().unwrap();
        let u1 = update_at("v1", 1, 10);
        let u2 = update_at("v1", 2, 20);
        let u3 = update_at("v1", 3, 30);
        store(dir.path(), &u1).unwrap();
        store(dir.path(), &u2).unwrap();
        store(dir.path(), &u3).unwrap();
        let after = filter_since(dir.path(), "v1", Some(&u1.policy_hash)).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].policy_hash, u2.policy_hash);
    }

    #[test]
    fn pagination_has_no_gaps_or_duplicates() {
        let list: Vec<PolicyUpdate> = (0..7).map(|i| update_at("v1", i, 10 + i as u64)).collect();
        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = paginate(&list, cursor.as_deref(), 3);
            seen.extend(page.items.iter().map(|u| u.policy_hash.clone()));
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        let expected: Vec<String> = list.iter().map(|u| u.policy_hash.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn limit_is_clamped_into_range() {
        let list: Vec<PolicyUpdate> = (0..3).map(|i| update_at("v1", i, 10)).collect();
        let page = paginate(&list, None, 0);
        assert_eq!(page.items.len(), 1);
        let page = paginate(&list, None, 10_000);
        assert_eq!(page.items.len(), 3);
    }

    #[test]
    fn empty_feed_manifest_uses_zero_seed_and_empty_root() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("villages").join("v1")).unwrap();
        let manifest = build_manifest(dir.path(), "v1", ts(0)).unwrap();
        assert_eq!(manifest.count, 0);
        assert_eq!(manifest.merkle_root, crate::canon::empty_root_hex());
        assert_eq!(manifest.chain_head, crate::canon::zero_hash_hex());
        assert!(manifest.head_policy_hash.is_none());
    }

    #[test]
    fn signed_manifest_verifies_and_rejects_untrusted_signer() {
        let dir = tempdir().unwrap();
        store(dir.path(), &update_at("v1", 0, 30)).unwrap();
        let manifest = build_manifest(dir.path(), "v1", ts(1)).unwrap();
        let key = generate_signing_key();
        let signed = sign_manifest(manifest, &key);
        assert!(verify_manifest(&signed, None).unwrap());

        let other_hash = crate::canon::key_hash(&generate_signing_key().verifying_key().to_bytes());
        let trusted: HashSet<String> = [other_hash].into_iter().collect();
        assert!(!verify_manifest(&signed, Some(&trusted)).unwrap());
    }

    #[test]
    fn signer_allowed_requires_signature_when_policy_demands_it() {
        let policy = Policy(json!({"require_policy_signature": true}));
        let unsigned = update_at("v1", 0, 30);
        let err = signer_allowed(&policy, &unsigned).unwrap_err();
        assert_eq!(err.to_string(), "invalid signature: signature required");

        let key = generate_signing_key();
        let signed = sign_legacy(unsigned, &key);
        assert!(signer_allowed(&policy, &signed).is_ok());
    }

    #[test]
    fn signer_allowed_dispatches_to_weighted_quorum_model() {
        let k1 = generate_signing_key();
        let k2 = generate_signing_key();
        let h1 = crate::canon::key_hash(&k1.verifying_key().to_bytes());
        let h2 = crate::canon::key_hash(&k2.verifying_key().to_bytes());
        let policy = Policy(json!({
            "require_policy_signature": true,
            "policy_quorum": {"model": "weighted", "threshold_weight": 3.0},
            "policy_signer_weights": {h1.clone(): 2.0, h2.clone(): 2.0},
        }));
        let unsigned = update_at("v1", 0, 30);
        let once_signed = policy_update::add_signature(unsigned, &k1);
        assert!(signer_allowed(&policy, &once_signed).is_err());
        let twice_signed = policy_update::add_signature(once_signed, &k2);
        assert!(signer_allowed(&policy, &twice_signed).is_ok());
    }
}
