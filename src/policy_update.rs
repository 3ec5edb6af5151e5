//! Signed policy-update artifacts: hash computation, legacy and multisig
//! signing, and the three quorum verifiers (m-of-n, weighted, role-based).
//!
//! Each verifier iterates a signature list, tracks a seen-set of key hashes
//! to reject duplicate signers, and bails out on the first bad signature
//! before counting quorum.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto::{self, CryptoError};
use crate::error::TrustError;
use crate::policy::Policy;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

/// `proposal -> approved -> active`; `rolled_back` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Signed by some subset, not yet quorum-checked.
    Proposal,
    /// Quorum met under the policy in force when it was checked.
    Approved,
    /// Applied as the village's current policy.
    Active,
    /// Superseded by a rollback; terminal.
    RolledBack,
}

/// One multisig signature entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEntry {
    /// Base64-encoded Ed25519 public key.
    pub public_key: String,
    /// Base64-encoded Ed25519 signature.
    pub signature: String,
}

/// Machine-readable JSON-pointer diff of a policy change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyChangeSummary {
    /// Pointer paths added.
    #[serde(default)]
    pub added: Vec<String>,
    /// Pointer paths removed.
    #[serde(default)]
    pub removed: Vec<String>,
    /// Pointer paths changed.
    #[serde(default)]
    pub changed: Vec<String>,
}

/// A per-role minimum inside [`QuorumMetadata`] (mirrors
/// [`crate::policy::RoleRequirement`] but is the snapshot embedded in the
/// signed artifact, not the policy's live configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumRoleRequirement {
    /// Role name.
    pub role: String,
    /// Minimum distinct signers for that role.
    #[serde(default = "default_min_signers")]
    pub min_signers: u64,
}

fn default_min_signers() -> u64 {
    1
}

/// Audit-friendly snapshot of the quorum configuration the update was
/// intended to satisfy, embedded in and signed as part of the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumMetadata {
    /// `m_of_n` | `weighted` | `role_based`.
    #[serde(default = "default_model")]
    pub model: String,
    /// Threshold for `m_of_n`.
    #[serde(default)]
    pub threshold_m: Option<u64>,
    /// Threshold for `weighted`.
    #[serde(default)]
    pub threshold_weight: Option<f64>,
    /// `sha256(canonical_json(policy_signers_snapshot))`, if recorded.
    #[serde(default)]
    pub signer_set_hash: Option<String>,
    /// Per-role requirements for `role_based`.
    #[serde(default)]
    pub role_requirements: Vec<QuorumRoleRequirement>,
}

fn default_model() -> String {
    "m_of_n".to_string()
}

/// A signed policy-update artifact. Both legacy single-sig and multisig
/// fields are always present on the struct — whichever are populated is the
/// signature material in force — so the exact-JSON-shape round trip the
/// integrity invariant needs is preserved regardless of which signing path
/// produced the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyUpdate {
    /// The village this update applies to.
    pub village_id: String,
    /// Creation timestamp, UTC.
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    /// Human or service identity that produced the update.
    #[serde(default)]
    pub actor: Option<String>,
    /// The effective policy content for this lifecycle state.
    pub policy: Policy,
    /// `hex(SHA-256(C(policy)))`.
    pub policy_hash: String,
    /// Defaults to `policy_hash` when unset.
    #[serde(default)]
    pub policy_version_id: Option<String>,
    /// Where this update sits in its lifecycle.
    #[serde(default = "default_lifecycle")]
    pub lifecycle_state: LifecycleState,
    /// Predecessor policy hash, threading the (possibly forking) DAG.
    #[serde(default)]
    pub previous_policy_hash: Option<String>,
    /// If this update is a rollback, the target policy hash.
    #[serde(default)]
    pub rollback_to_policy_hash: Option<String>,
    /// Activation time, if time-gated.
    #[serde(default, with = "timestamp::option")]
    pub activation_time: Option<OffsetDateTime>,
    /// Activation block/ledger height, if height-gated.
    #[serde(default)]
    pub activation_height: Option<u64>,
    /// Quorum snapshot under which this update was intended to pass.
    #[serde(default)]
    pub quorum: Option<QuorumMetadata>,
    /// Optional machine-readable diff summary.
    #[serde(default)]
    pub change_summary: Option<PolicyChangeSummary>,
    /// Signature algorithm name; always `Ed25519` at verification time.
    #[serde(default = "default_signature_alg")]
    pub signature_alg: String,
    /// Legacy single-signature public key.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Legacy single signature.
    #[serde(default)]
    pub signature: Option<String>,
    /// Multisig signature entries.
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
    /// Forward-compatible expiry marker; unused by any enforcement logic in
    /// this core.
    #[serde(default, with = "timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
}

fn default_lifecycle() -> LifecycleState {
    LifecycleState::Proposal
}

fn default_signature_alg() -> String {
    "Ed25519".to_string()
}

/// Arguments for [`build`], grouped since most are optional.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Defaults to `proposal`.
    pub lifecycle_state: Option<LifecycleState>,
    /// Predecessor policy hash.
    pub previous_policy_hash: Option<String>,
    /// Rollback target.
    pub rollback_to_policy_hash: Option<String>,
    /// Activation time gate.
    pub activation_time: Option<OffsetDateTime>,
    /// Activation height gate.
    pub activation_height: Option<u64>,
    /// Overrides the default `policy_hash`-derived version id.
    pub policy_version_id: Option<String>,
    /// Quorum snapshot to embed.
    pub quorum: Option<QuorumMetadata>,
    /// Machine-readable diff summary.
    pub change_summary: Option<PolicyChangeSummary>,
    /// Forward-compatible expiry marker.
    pub expires_at: Option<OffsetDateTime>,
}

/// Builds an unsigned artifact with `policy_hash` computed from `policy`.
pub fn build(
    village_id: &str,
    policy: Policy,
    actor: Option<String>,
    created_at: OffsetDateTime,
    opts: BuildOptions,
) -> PolicyUpdate {
    let policy_hash = policy.hash();
    PolicyUpdate {
        village_id: village_id.to_string(),
        created_at,
        actor,
        policy,
        policy_version_id: Some(opts.policy_version_id.unwrap_or_else(|| policy_hash.clone())),
        policy_hash,
        lifecycle_state: opts.lifecycle_state.unwrap_or(LifecycleState::Proposal),
        previous_policy_hash: opts.previous_policy_hash,
        rollback_to_policy_hash: opts.rollback_to_policy_hash,
        activation_time: opts.activation_time,
        activation_height: opts.activation_height,
        quorum: opts.quorum,
        change_summary: opts.change_summary,
        signature_alg: default_signature_alg(),
        public_key: None,
        signature: None,
        signatures: Vec::new(),
        expires_at: opts.expires_at,
    }
}

/// The artifact with `public_key`, `signature`, and `signatures` stripped —
/// the payload that is hashed and signed.
pub fn payload_for_signing(update: &PolicyUpdate) -> serde_json::Value {
    let mut value = serde_json::to_value(update).expect("PolicyUpdate always serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.remove("public_key");
        obj.remove("signature");
        obj.remove("signatures");
    }
    value
}

/// `hex(SHA-256(C(payload_for_signing(update))))` — the deterministic update
/// hash used for linking and manifests.
pub fn compute_update_hash(update: &PolicyUpdate) -> String {
    sha256_hex(&canonical_json(&payload_for_signing(update)))
}

/// Recomputes `policy_hash` from `update.policy` and checks it matches.
pub fn hash_matches(update: &PolicyUpdate) -> bool {
    update.policy_hash == update.policy.hash()
}

/// Produces a legacy single-signature update (sets `public_key`/`signature`).
pub fn sign_legacy(mut update: PolicyUpdate, signing_key: &SigningKey) -> PolicyUpdate {
    let payload = canonical_json(&payload_for_signing(&update));
    let signature = crypto::sign_payload(signing_key, &payload);
    update.public_key = Some(crypto::encode_public_key_base64(&signing_key.verifying_key()));
    update.signature = Some(crypto::encode_signature_base64(&signature));
    update
}

/// Appends a signature entry to `signatures[]`, de-duplicated by signer
/// key-hash (a resubmission by the same signer replaces nothing and adds
/// nothing).
pub fn add_signature(mut update: PolicyUpdate, signing_key: &SigningKey) -> PolicyUpdate {
    let payload = canonical_json(&payload_for_signing(&update));
    let signature = crypto::sign_payload(signing_key, &payload);
    let public_key = crypto::encode_public_key_base64(&signing_key.verifying_key());
    let new_key_hash = key_hash_of_b64(&public_key).unwrap_or_default();

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in update.signatures.drain(..) {
        let kh = key_hash_of_b64(&entry.public_key).unwrap_or_default();
        if !seen.insert(kh) {
            continue;
        }
        out.push(entry);
    }
    if !seen.contains(&new_key_hash) {
        out.push(SignatureEntry {
            public_key,
            signature: crypto::encode_signature_base64(&signature),
        });
    }
    update.signatures = out;
    update
}

fn key_hash_of_b64(public_key_b64: &str) -> Option<String> {
    let vk = crypto::decode_public_key_base64(public_key_b64).ok()?;
    Some(crate::canon::key_hash(&vk.to_bytes()))
}

fn verify_one(payload: &[u8], public_key_b64: &str, signature_b64: &str) -> Result<bool, CryptoError> {
    crypto::verify_signature_base64(public_key_b64, payload, signature_b64)
}

/// `verify_any` — true iff the hash matches and at least one signature
/// (legacy or multi) verifies. Malformed signature material is treated as
/// "does not verify" rather than propagated as an error, so a caller never
/// has to distinguish a forged signature from a corrupt one.
pub fn verify_any(update: &PolicyUpdate) -> bool {
    if !hash_matches(update) {
        return false;
    }
    let payload = canonical_json(&payload_for_signing(update));
    for entry in &update.signatures {
        if verify_one(&payload, &entry.public_key, &entry.signature).unwrap_or(false) {
            return true;
        }
    }
    if let (Some(pk), Some(sig)) = (&update.public_key, &update.signature) {
        if verify_one(&payload, pk, sig).unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Collects the set of distinct signer key-hashes whose signature verifies
/// over `update`'s signing payload, honoring an optional allowlist filter.
fn collect_valid_signers(update: &PolicyUpdate, allowlist: Option<&HashSet<String>>) -> HashSet<String> {
    let payload = canonical_json(&payload_for_signing(update));
    let mut valid = HashSet::new();

    let mut consider = |public_key_b64: &str, signature_b64: &str| {
        let kh = match key_hash_of_b64(public_key_b64) {
            Some(kh) => kh,
            None => return,
        };
        if let Some(allow) = allowlist {
            if !allow.contains(&kh) {
                return;
            }
        }
        if verify_one(&payload, public_key_b64, signature_b64).unwrap_or(false) {
            valid.insert(kh);
        }
    };

    for entry in &update.signatures {
        consider(&entry.public_key, &entry.signature);
    }
    if let (Some(pk), Some(sig)) = (&update.public_key, &update.signature) {
        consider(pk, sig);
    }
    valid
}

/// `verify_m_of_n` — counts distinct valid signers (by key-hash); signers
/// outside a non-empty allowlist are ignored; legacy signature counts as one
/// signer.
pub fn verify_m_of_n(
    update: &PolicyUpdate,
    m: u64,
    allowlist: Option<&HashSet<String>>,
) -> Result<(), TrustError> {
    if m < 1 {
        return Err(TrustError::InvalidQuorumConfig("m must be >= 1".to_string()));
    }
    if !hash_matches(update) {
        return Err(TrustError::InvalidSignature("policy_hash mismatch".to_string()));
    }
    let valid = collect_valid_signers(update, allowlist);
    if valid.len() as u64 >= m {
        Ok(())
    } else {
        Err(TrustError::QuorumNotMet {
            valid: valid.len(),
            required: m as usize,
        })
    }
}

/// A pluggable signer-weight oracle for [`verify_weighted`]. `policy_signer_weights`
/// is the in-policy case (a plain `HashMap`), but this trait lets a
/// future weight source (stake, reputation) back the same verifier without
/// changing its signature.
pub trait SignerWeights {
    /// The weight assigned to `key_hash`, if any.
    fn weight_for(&self, key_hash: &str) -> Option<f64>;
    /// How many signers this source has an opinion about, used only for the
    /// diagnostic `required` count on a failed quorum.
    fn signer_count(&self) -> usize;
}

impl SignerWeights for HashMap<String, f64> {
    fn weight_for(&self, key_hash: &str) -> Option<f64> {
        self.get(key_hash).copied()
    }

    fn signer_count(&self) -> usize {
        self.len()
    }
}

/// `verify_weighted` — sum of distinct valid signers' weights must meet
/// `required_weight`.
pub fn verify_weighted<W: SignerWeights>(
    update: &PolicyUpdate,
    weights_by_key_hash: &W,
    required_weight: f64,
    allowlist: Option<&HashSet<String>>,
) -> Result<f64, TrustError> {
    if required_weight <= 0.0 {
        return Err(TrustError::InvalidQuorumConfig(
            "required_weight must be > 0".to_string(),
        ));
    }
    if !hash_matches(update) {
        return Err(TrustError::InvalidSignature("policy_hash mismatch".to_string()));
    }
    let valid = collect_valid_signers(update, allowlist);
    let achieved: f64 = valid.iter().map(|kh| weights_by_key_hash.weight_for(kh).unwrap_or(0.0)).sum();
    if achieved >= required_weight {
        Ok(achieved)
    } else {
        Err(TrustError::QuorumNotMet {
            valid: valid.len(),
            required: weights_by_key_hash.signer_count().max(1),
        })
    }
}

/// `verify_role_based` — each required `{role, min_signers}` must be
/// satisfied by distinct valid signers whose role set includes that role.
pub fn verify_role_based(
    update: &PolicyUpdate,
    roles_by_key_hash: &HashMap<String, HashSet<String>>,
    requirements: &[QuorumRoleRequirement],
    allowlist: Option<&HashSet<String>>,
) -> Result<HashMap<String, u64>, TrustError> {
    if !hash_matches(update) {
        return Err(TrustError::InvalidSignature("policy_hash mismatch".to_string()));
    }
    let valid = collect_valid_signers(update, allowlist);
    let mut role_counts: HashMap<String, u64> = requirements.iter().map(|r| (r.role.clone(), 0)).collect();
    for kh in &valid {
        if let Some(roles) = roles_by_key_hash.get(kh) {
            for role in roles {
                if let Some(count) = role_counts.get_mut(role) {
                    *count += 1;
                }
            }
        }
    }
    let missing: Vec<String> = requirements
        .iter()
        .filter(|req| role_counts.get(&req.role).copied().unwrap_or(0) < req.min_signers)
        .map(|req| {
            format!(
                "{}({}/{})",
                req.role,
                role_counts.get(&req.role).copied().unwrap_or(0),
                req.min_signers
            )
        })
        .collect();
    if missing.is_empty() {
        Ok(role_counts)
    } else {
        Err(TrustError::QuorumNotMet {
            valid: valid.len(),
            required: requirements.iter().map(|r| r.min_signers as usize).sum(),
        })
    }
}
