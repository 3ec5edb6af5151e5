//! The village policy object: an open string-to-JSON mapping, so a village
//! can carry fields this crate doesn't yet know about. `Policy` wraps the
//! raw `serde_json::Value`
//! so an older peer that doesn't recognize a newer key still re-hashes the
//! policy identically (the round-trip requirement); typed accessors parse
//! the recognized fields on demand for enforcement logic.

use crate::canon::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// `visibility` values recognized by the policy schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Only the village's own members may read.
    Private,
    /// Any member of the federation may read.
    Village,
    /// Unauthenticated reads are permitted.
    Public,
}

/// A role's operation grants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// May pull policy/claims.
    #[serde(default)]
    pub can_pull: bool,
    /// May push bundles.
    #[serde(default)]
    pub can_push: bool,
    /// May manage policy/membership.
    #[serde(default)]
    pub can_manage: bool,
}

/// One role-based quorum requirement: at least `min_signers` distinct valid
/// signers whose role set includes `role`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRequirement {
    /// The role name.
    pub role: String,
    /// Minimum distinct signers required for that role.
    #[serde(default = "default_min_signers")]
    pub min_signers: u64,
}

fn default_min_signers() -> u64 {
    1
}

/// The quorum model a policy update must satisfy to be considered approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumModel {
    /// M distinct valid signers out of an allowlist.
    MOfN,
    /// Sum of distinct valid signers' weights meets a threshold.
    Weighted,
    /// Each named role meets its own distinct-signer minimum.
    RoleBased,
}

/// `policy_quorum` — the quorum configuration a village's policy declares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Which verifier to dispatch to.
    pub model: QuorumModel,
    /// `m` for `m_of_n`.
    #[serde(default)]
    pub threshold_m: Option<u64>,
    /// Required total weight for `weighted`.
    #[serde(default)]
    pub threshold_weight: Option<f64>,
    /// Per-role minimums for `role_based`.
    #[serde(default)]
    pub role_requirements: Vec<RoleRequirement>,
}

/// An open mapping from string to JSON value representing a village's
/// policy. Preserves unknown keys verbatim under re-hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy(pub serde_json::Value);

impl Default for Policy {
    fn default() -> Self {
        Self::empty()
    }
}

impl Policy {
    /// An empty policy object (`{}`).
    pub fn empty() -> Self {
        Policy(serde_json::Value::Object(Default::default()))
    }

    /// `policy_hash = hex(SHA-256(C(policy)))`.
    pub fn hash(&self) -> String {
        sha256_hex(&canonical_json(&self.0))
    }

    fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.as_object().and_then(|obj| obj.get(key))
    }

    /// `visibility`, defaulting to `village` when absent or unrecognized.
    pub fn visibility(&self) -> Visibility {
        self.get("visibility")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(Visibility::Village)
    }

    /// `allowed_predicates` as a set; empty means no predicate is allowed.
    pub fn allowed_predicates(&self) -> HashSet<String> {
        self.string_set("allowed_predicates")
    }

    /// `max_window_days`, if set.
    pub fn max_window_days(&self) -> Option<u64> {
        self.get("max_window_days").and_then(|v| v.as_u64())
    }

    /// `allow_unverified`, defaulting to `false`.
    pub fn allow_unverified(&self) -> bool {
        self.get("allow_unverified").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// `retention_days`, if set.
    pub fn retention_days(&self) -> Option<u64> {
        self.get("retention_days").and_then(|v| v.as_u64())
    }

    /// `rate_limit_per_min`, if set.
    pub fn rate_limit_per_min(&self) -> Option<u32> {
        self.get("rate_limit_per_min").and_then(|v| v.as_u64()).map(|v| v as u32)
    }

    /// `issuer_allowlist` key hashes.
    pub fn issuer_allowlist(&self) -> HashSet<String> {
        self.string_set("issuer_allowlist")
    }

    /// `issuer_blocklist` key hashes.
    pub fn issuer_blocklist(&self) -> HashSet<String> {
        self.string_set("issuer_blocklist")
    }

    /// `issuer_id_allowlist`.
    pub fn issuer_id_allowlist(&self) -> HashSet<String> {
        self.string_set("issuer_id_allowlist")
    }

    /// `issuer_id_blocklist`.
    pub fn issuer_id_blocklist(&self) -> HashSet<String> {
        self.string_set("issuer_id_blocklist")
    }

    /// `require_issuer_allowlist`, defaulting to `false`.
    pub fn require_issuer_allowlist(&self) -> bool {
        self.get("require_issuer_allowlist").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// `require_policy_signature`, defaulting to `false`.
    pub fn require_policy_signature(&self) -> bool {
        self.get("require_policy_signature").and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// `policy_signer_allowlist` key hashes.
    pub fn policy_signer_allowlist(&self) -> HashSet<String> {
        self.string_set("policy_signer_allowlist")
    }

    /// `policy_signature_threshold_m`, the m-of-n fallback threshold.
    pub fn policy_signature_threshold_m(&self) -> Option<u64> {
        self.get("policy_signature_threshold_m").and_then(|v| v.as_u64())
    }

    /// `policy_quorum`, if the policy declares an explicit quorum model.
    pub fn policy_quorum(&self) -> Option<QuorumConfig> {
        self.get("policy_quorum")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// `policy_signer_weights`: key hash -> weight.
    pub fn policy_signer_weights(&self) -> HashMap<String, f64> {
        self.get("policy_signer_weights")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|w| (k.clone(), w)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `policy_signer_roles`: key hash -> set of role names.
    pub fn policy_signer_roles(&self) -> HashMap<String, HashSet<String>> {
        self.get("policy_signer_roles")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let roles = v
                            .as_array()
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|r| r.as_str().map(String::from))
                                    .collect()
                            })
                            .unwrap_or_default();
                        (k.clone(), roles)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `capabilities`: role name -> grants. Defaults to the common
    /// observer/member/admin roles when the policy omits the key.
    pub fn capabilities(&self) -> HashMap<String, Capabilities> {
        self.get("capabilities")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_else(default_capabilities)
    }

    /// `submission_quota_per_day`, defaulting to `0` (unlimited).
    pub fn submission_quota_per_day(&self) -> u64 {
        self.get("submission_quota_per_day").and_then(|v| v.as_u64()).unwrap_or(0)
    }

    /// `min_signature_alg` — recorded but never enforced.
    pub fn min_signature_alg(&self) -> String {
        self.get("min_signature_alg")
            .and_then(|v| v.as_str())
            .unwrap_or("Ed25519")
            .to_string()
    }

    fn string_set(&self, key: &str) -> HashSet<String> {
        self.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }
}

fn default_capabilities() -> HashMap<String, Capabilities> {
    let mut map = HashMap::new();
    map.insert(
        "observer".to_string(),
        Capabilities {
            can_pull: true,
            can_push: false,
            can_manage: false,
        },
    );
    map.insert(
        "member".to_string(),
        Capabilities {
            can_pull: true,
            can_push: true,
            can_manage: false,
        },
    );
    map.insert(
        "admin".to_string(),
        Capabilities {
            can_pull: true,
            can_push: true,
            can_manage: true,
        },
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_policy_has_stable_hash() {
        let a = Policy::empty();
        let b = Policy(json!({}));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_is_independent_of_key_order() {
        let a = Policy(json!({"visibility": "public", "max_window_days": 30}));
        let b = Policy(json!({"max_window_days": 30, "visibility": "public"}));
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn unknown_keys_round_trip_through_serde() {
        let p = Policy(json!({"visibility": "village", "future_field": {"x": 1}}));
        let text = serde_json::to_string(&p).unwrap();
        let parsed: Policy = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.hash(), p.hash());
        assert_eq!(parsed.0.get("future_field"), p.0.get("future_field"));
    }

    #[test]
    fn default_capabilities_grant_member_push() {
        let p = Policy::empty();
        let caps = p.capabilities();
        assert!(caps["member"].can_push);
        assert!(!caps["observer"].can_push);
        assert!(caps["admin"].can_manage);
    }

    #[test]
    fn issuer_allowed_fallback_true_when_no_lists_configured() {
        let p = Policy::empty();
        assert!(p.issuer_allowlist().is_empty());
        assert!(p.issuer_blocklist().is_empty());
        assert!(!p.require_issuer_allowlist());
    }
}
