//! The external-interface surface, modeled as a trait plus an in-process
//! default implementation rather than a running HTTP server. [`VillageApi`]'s
//! methods correspond 1:1 to the node's external operations; a binary crate
//! binds them to whatever HTTP framework it likes. [`LocalNode`] is the
//! default in-process backend: a plain struct implementing the trait over
//! local filesystem state.

use crate::admission::{self, AdmissionOutcome};
use crate::audit;
use crate::bundle::ClaimBundle;
use crate::config::NodeConfig;
use crate::crypto::{CryptoError, NodeKeySource};
use crate::error::TrustError;
use crate::policy_feed::{self, FeedManifest};
use crate::policy_update::{self, PolicyUpdate};
use crate::ratelimit::RateLimiter;
use crate::transparency::{self, TransparencyEntry};
use crate::village;
use ed25519_dalek::SigningKey;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Validates `village_id` against `^[A-Za-z0-9_-]+$`; every path in the
/// external interface rejects a violation with `invalid_village_id`.
pub fn validate_village_id(village_id: &str) -> Result<(), TrustError> {
    let ok = !village_id.is_empty()
        && village_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(TrustError::InvalidVillageId(village_id.to_string()))
    }
}

/// The `/policy/updates_page` response shape.
#[derive(Debug, Clone)]
pub struct PolicyUpdatesPage {
    /// The returned page of updates.
    pub items: Vec<PolicyUpdate>,
    /// `policy_hash` of the last item, if more remain.
    pub next_cursor: Option<String>,
    /// The cursor the caller supplied.
    pub cursor: Option<String>,
    /// The `since` hash the caller supplied.
    pub since: Option<String>,
    /// The clamped-to-`[1, 500]` limit actually applied.
    pub limit: usize,
    /// The village this page describes.
    pub village_id: String,
}

/// The `/audit/export` response shape.
#[derive(Debug, Clone)]
pub struct AuditExport {
    /// The exported bytes (JSON or CSV, per the requested `fmt`).
    pub body: Vec<u8>,
    /// `sha256_hex` of `body`.
    pub digest_hex: String,
    /// Number of audit events included.
    pub count: usize,
    /// Base64 Ed25519 signature over `digest_hex`'s raw bytes, present iff
    /// `sign` was requested and a node key is configured.
    pub signature: Option<String>,
}

/// The node's external operations, one method per endpoint. Implementations
/// authenticate the bearer token and check the caller's role capability
/// themselves; callers pass already-parsed arguments, not raw HTTP requests.
pub trait VillageApi {
    /// `GET /villages/{v}/policy/latest` — no auth.
    fn policy_latest(&self, village_id: &str) -> Result<PolicyUpdate, TrustError>;
    /// `GET /villages/{v}/policy/updates?since=` — no auth.
    fn policy_updates_since(&self, village_id: &str, since: Option<&str>) -> Result<Vec<PolicyUpdate>, TrustError>;
    /// `GET /villages/{v}/policy/updates_page?since=&cursor=&limit=` — no auth.
    fn policy_updates_page(
        &self,
        village_id: &str,
        since: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<PolicyUpdatesPage, TrustError>;
    /// `GET /villages/{v}/policy/manifest` — no auth.
    fn policy_manifest(&self, village_id: &str, generated_at: OffsetDateTime) -> Result<FeedManifest, TrustError>;
    /// `POST /villages/{v}/policy` — bearer with `manage`. Validates quorum
    /// under the village's current policy, stores the update, applies it,
    /// and records a transparency-log entry if a node key is configured.
    fn submit_policy_update(
        &self,
        village_id: &str,
        bearer_token: &str,
        update: PolicyUpdate,
        now: OffsetDateTime,
    ) -> Result<PolicyUpdate, TrustError>;
    /// `GET /villages/{v}/claims/latest` — bearer with `pull`.
    fn claims_latest(&self, village_id: &str, bearer_token: &str) -> Result<ClaimBundle, TrustError>;
    /// `POST /villages/{v}/inbox` — bearer with `push`. Runs the admission
    /// pipeline and is rate-limited per `(village_id, client_key)`.
    fn submit_bundle(
        &self,
        village_id: &str,
        bearer_token: &str,
        bundle: ClaimBundle,
        client_key: &str,
        now: OffsetDateTime,
    ) -> Result<AdmissionOutcome, TrustError>;
    /// `GET /villages/{v}/transparency/policy_log?limit=` — no auth.
    fn transparency_tail(&self, village_id: &str, limit: usize) -> Result<Vec<TransparencyEntry>, TrustError>;
    /// `GET /villages/{v}/audit/export?fmt=&sign=` — operator-only (auth
    /// left to the caller; this core has no separate operator role).
    fn audit_export(&self, fmt: &str, sign: bool) -> Result<AuditExport, TrustError>;
}

/// The default in-process [`VillageApi`] backend over the filesystem
/// layout rooted at `villages_root`/`store_root`.
pub struct LocalNode {
    /// Root of `villages/{v}/...` (policy feed, membership, trust anchors).
    pub villages_root: PathBuf,
    /// Root of `store/...` (bundles, index, audit, transparency, quarantine).
    pub store_root: PathBuf,
    /// The node's own signing key, if configured.
    pub node_key: Option<SigningKey>,
    /// Fallback `rate_limit_per_min` for villages whose policy omits one.
    pub default_rate_limit_per_min: u32,
    rate_limiter: RateLimiter,
}

impl LocalNode {
    /// Builds a node rooted at `data_root`, loading its signing key (if any)
    /// from `key_source`. `store/` is laid out under `data_root` alongside
    /// `villages/`.
    pub fn new(
        data_root: impl Into<PathBuf>,
        key_source: &NodeKeySource,
        default_rate_limit_per_min: u32,
    ) -> Result<Self, CryptoError> {
        let data_root = data_root.into();
        Ok(Self {
            store_root: data_root.join("store"),
            villages_root: data_root,
            node_key: key_source.load()?,
            default_rate_limit_per_min,
            rate_limiter: RateLimiter::new(),
        })
    }

    /// Builds a node from a loaded [`NodeConfig`].
    pub fn from_config(config: &NodeConfig) -> Result<Self, CryptoError> {
        Self::new(
            config.data_root.clone(),
            &config.key_source,
            config.default_rate_limit_per_min,
        )
    }

    fn village(&self, village_id: &str) -> Result<village::Village, TrustError> {
        village::load_village(&self.villages_root, village_id)
    }

    fn authorize(&self, village_id: &str, bearer_token: &str, action: &str) -> Result<village::VillageMember, TrustError> {
        let village = self.village(village_id)?;
        let member = village::authorize(&self.villages_root, village_id, bearer_token)?
            .ok_or_else(|| TrustError::Forbidden("bearer token absent, invalid, or revoked".to_string()))?;
        if !village::role_can(&village.policy, &member.role, action) {
            return Err(TrustError::Forbidden(format!(
                "role '{}' lacks '{action}' capability",
                member.role
            )));
        }
        Ok(member)
    }

    /// Checks `(village_id, client_key)` against the village's
    /// `rate_limit_per_min` (or the node default). Applies only to the
    /// village-scoped write paths. Exposed so a binary crate's HTTP layer
    /// can call it directly before dispatching to a [`VillageApi`] method.
    pub fn check_rate_limit(&self, village_id: &str, client_key: &str, now: OffsetDateTime) -> Result<(), TrustError> {
        let limit = self
            .village(village_id)
            .ok()
            .and_then(|v| v.policy.rate_limit_per_min())
            .unwrap_or(self.default_rate_limit_per_min);
        let now_minute = now.unix_timestamp() / 60;
        if self.rate_limiter.check(village_id, client_key, limit, now_minute) {
            Ok(())
        } else {
            Err(TrustError::RateLimited)
        }
    }
}

impl VillageApi for LocalNode {
    fn policy_latest(&self, village_id: &str) -> Result<PolicyUpdate, TrustError> {
        validate_village_id(village_id)?;
        policy_feed::latest(&self.villages_root, village_id)?
            .ok_or_else(|| TrustError::NotFound(format!("no policy for village {village_id}")))
    }

    fn policy_updates_since(&self, village_id: &str, since: Option<&str>) -> Result<Vec<PolicyUpdate>, TrustError> {
        validate_village_id(village_id)?;
        Ok(policy_feed::filter_since(&self.villages_root, village_id, since)?)
    }

    fn policy_updates_page(
        &self,
        village_id: &str,
        since: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<PolicyUpdatesPage, TrustError> {
        validate_village_id(village_id)?;
        let list = policy_feed::filter_since(&self.villages_root, village_id, since)?;
        let page = policy_feed::paginate(&list, cursor, limit);
        Ok(PolicyUpdatesPage {
            items: page.items,
            next_cursor: page.next_cursor,
            cursor: cursor.map(String::from),
            since: since.map(String::from),
            limit: limit.clamp(1, 500),
            village_id: village_id.to_string(),
        })
    }

    fn policy_manifest(&self, village_id: &str, generated_at: OffsetDateTime) -> Result<FeedManifest, TrustError> {
        validate_village_id(village_id)?;
        let manifest = policy_feed::build_manifest(&self.villages_root, village_id, generated_at)?;
        Ok(match &self.node_key {
            Some(key) => policy_feed::sign_manifest(manifest, key),
            None => manifest,
        })
    }

    fn submit_policy_update(
        &self,
        village_id: &str,
        bearer_token: &str,
        update: PolicyUpdate,
        now: OffsetDateTime,
    ) -> Result<PolicyUpdate, TrustError> {
        validate_village_id(village_id)?;
        self.authorize(village_id, bearer_token, "manage")?;
        if update.village_id != village_id {
            return Err(TrustError::InvalidVillageId(update.village_id.clone()));
        }
        if !policy_update::hash_matches(&update) {
            return Err(TrustError::InvalidSignature("policy_hash mismatch".to_string()));
        }
        let village = self.village(village_id)?;
        policy_feed::signer_allowed(&village.policy, &update)?;

        policy_feed::store(&self.villages_root, &update)?;
        village::apply_policy_update(&self.villages_root, village_id, update.policy.clone(), update.actor.as_deref(), now)?;

        if let Some(key) = &self.node_key {
            transparency::append_entry(
                &self.store_root,
                village_id,
                &update.policy_hash,
                Some(&policy_update::compute_update_hash(&update)),
                serde_json::json!({"lifecycle_state": update.lifecycle_state}),
                key,
                now,
            )?;
        }
        Ok(update)
    }

    fn claims_latest(&self, village_id: &str, bearer_token: &str) -> Result<ClaimBundle, TrustError> {
        validate_village_id(village_id)?;
        self.authorize(village_id, bearer_token, "pull")?;
        admission::latest_bundle(&self.store_root, village_id)?
            .ok_or_else(|| TrustError::NotFound(format!("no claims for village {village_id}")))
    }

    fn submit_bundle(
        &self,
        village_id: &str,
        bearer_token: &str,
        bundle: ClaimBundle,
        client_key: &str,
        now: OffsetDateTime,
    ) -> Result<AdmissionOutcome, TrustError> {
        validate_village_id(village_id)?;
        self.authorize(village_id, bearer_token, "push")?;
        self.check_rate_limit(village_id, client_key, now)?;
        let village = self.village(village_id)?;
        admission::ingest(&self.store_root, village_id, &village.policy, &bundle, self.node_key.as_ref(), now)
    }

    fn transparency_tail(&self, village_id: &str, limit: usize) -> Result<Vec<TransparencyEntry>, TrustError> {
        validate_village_id(village_id)?;
        Ok(transparency::tail(&self.store_root, village_id, limit)?)
    }

    fn audit_export(&self, fmt: &str, sign: bool) -> Result<AuditExport, TrustError> {
        let out_path = self.store_root.join("audit").join(format!("export.{fmt}"));
        let (digest_hex, count) = match fmt {
            "json" => audit::export_audit_json(&self.store_root, &out_path)?,
            "csv" => audit::export_audit_csv(&self.store_root, &out_path)?,
            other => return Err(TrustError::Decode(format!("unsupported export format: {other}"))),
        };
        let body = std::fs::read(&out_path)?;
        let signature = if sign {
            self.node_key
                .as_ref()
                .map(|key| audit::sign_digest_hex(&digest_hex, key))
                .transpose()?
        } else {
            None
        };
        Ok(AuditExport {
            body,
            digest_hex,
            count,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{self, Claim};
    use crate::crypto::generate_signing_key;
    use crate::policy::Policy;
    use crate::policy_update::BuildOptions;
    use crate::village::{Village, VillageGovernance};
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn setup_village(data_root: &std::path::Path, village_id: &str, policy: Policy) {
        village::save_village(
            data_root,
            &Village {
                village_id: village_id.to_string(),
                name: "Test".to_string(),
                description: String::new(),
                created_at: ts(0),
                governance: VillageGovernance::default(),
                policy,
            },
        )
        .unwrap();
    }

    fn node(data_root: &std::path::Path) -> LocalNode {
        LocalNode::new(data_root, &NodeKeySource::None, 60).unwrap()
    }

    #[test]
    fn invalid_village_id_is_rejected_before_any_lookup() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        let err = node.policy_latest("not/a/valid/id").unwrap_err();
        assert_eq!(err.code(), "invalid_village_id");
    }

    #[test]
    fn policy_latest_404s_on_empty_feed() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        setup_village(dir.path(), "v1", Policy::empty());
        let err = node.policy_latest("v1").unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn submit_policy_update_requires_manage_capability() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        setup_village(dir.path(), "v1", Policy::empty());
        village::add_member(dir.path(), "v1", "alice", "observer", "tok-1", ts(0)).unwrap();

        let update = policy_update::build("v1", Policy(json!({"max_window_days": 30})), None, ts(1), BuildOptions::default());
        let err = node.submit_policy_update("v1", "tok-1", update, ts(1)).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn submit_policy_update_applies_under_admin_and_updates_latest() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        setup_village(dir.path(), "v1", Policy::empty());
        village::add_member(dir.path(), "v1", "admin1", "admin", "tok-admin", ts(0)).unwrap();

        let update = policy_update::build("v1", Policy(json!({"max_window_days": 45})), None, ts(1), BuildOptions::default());
        node.submit_policy_update("v1", "tok-admin", update, ts(1)).unwrap();

        let latest = node.policy_latest("v1").unwrap();
        assert_eq!(latest.policy.max_window_days(), Some(45));
        let village = node.village("v1").unwrap();
        assert_eq!(village.policy.max_window_days(), Some(45));
    }

    #[test]
    fn submit_policy_update_rejects_when_quorum_not_met() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        let k1 = generate_signing_key();
        let k2 = generate_signing_key();
        let h1 = crate::canon::key_hash(&k1.verifying_key().to_bytes());
        let h2 = crate::canon::key_hash(&k2.verifying_key().to_bytes());
        let policy = Policy(json!({
            "require_policy_signature": true,
            "policy_signer_allowlist": [h1, h2],
            "policy_signature_threshold_m": 2,
        }));
        setup_village(dir.path(), "v1", policy);
        village::add_member(dir.path(), "v1", "admin1", "admin", "tok-admin", ts(0)).unwrap();

        let update = policy_update::build("v1", Policy(json!({"max_window_days": 10})), None, ts(1), BuildOptions::default());
        let update = policy_update::add_signature(update, &k1);
        let err = node.submit_policy_update("v1", "tok-admin", update, ts(1)).unwrap_err();
        assert_eq!(err.code(), "quorum_not_met");
    }

    #[test]
    fn submit_bundle_requires_push_and_runs_admission_pipeline() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        let issuer_key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        setup_village(dir.path(), "v1", policy);
        village::add_member(dir.path(), "v1", "bob", "member", "tok-bob", ts(0)).unwrap();

        let claim = Claim {
            issuer: "issuer-1".to_string(),
            subject: "a".to_string(),
            predicate: "links.weighted_to".to_string(),
            object: Some("b".to_string()),
            value: Some(json!(1.0)),
            window_days: 30,
            computed_at: ts(0),
            derivation: None,
            evidence: Vec::new(),
        };
        let bundle = bundle::sign_bundle(bundle::build("issuer-1", ts(0), 30, vec![claim]), &issuer_key);

        let outcome = node.submit_bundle("v1", "tok-bob", bundle.clone(), "1.2.3.4", ts(1)).unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Accepted { .. }));

        let latest = node.claims_latest("v1", "tok-bob").unwrap();
        assert_eq!(latest.bundle_id, bundle.bundle_id);
    }

    #[test]
    fn submit_bundle_is_rate_limited_per_village_and_client() {
        let dir = tempdir().unwrap();
        let node = LocalNode::new(dir.path(), &NodeKeySource::None, 1).unwrap();
        let issuer_key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30, "rate_limit_per_min": 1}));
        setup_village(dir.path(), "v1", policy);
        village::add_member(dir.path(), "v1", "bob", "member", "tok-bob", ts(0)).unwrap();

        let make_bundle = |window: u64| {
            let claim = Claim {
                issuer: "issuer-1".to_string(),
                subject: "a".to_string(),
                predicate: "links.weighted_to".to_string(),
                object: Some("b".to_string()),
                value: Some(json!(1.0)),
                window_days: window,
                computed_at: ts(0),
                derivation: None,
                evidence: Vec::new(),
            };
            bundle::sign_bundle(bundle::build("issuer-1", ts(0), window, vec![claim]), &issuer_key)
        };

        node.submit_bundle("v1", "tok-bob", make_bundle(30), "1.2.3.4", ts(1)).unwrap();
        let err = node.submit_bundle("v1", "tok-bob", make_bundle(31), "1.2.3.4", ts(1)).unwrap_err();
        assert_eq!(err.code(), "rate_limited");
    }

    #[test]
    fn audit_export_round_trips_json_and_signs_when_keyed() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let path = dir.path().join("key.b64");
        std::fs::write(&path, base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.to_bytes())).unwrap();
        let node = LocalNode::new(dir.path(), &NodeKeySource::File(path), 60).unwrap();

        let issuer_key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        setup_village(dir.path(), "v1", policy);
        village::add_member(dir.path(), "v1", "bob", "member", "tok-bob", ts(0)).unwrap();
        let claim = Claim {
            issuer: "issuer-1".to_string(),
            subject: "a".to_string(),
            predicate: "links.weighted_to".to_string(),
            object: None,
            value: None,
            window_days: 30,
            computed_at: ts(0),
            derivation: None,
            evidence: Vec::new(),
        };
        let bundle = bundle::sign_bundle(bundle::build("issuer-1", ts(0), 30, vec![claim]), &issuer_key);
        node.submit_bundle("v1", "tok-bob", bundle, "1.2.3.4", ts(1)).unwrap();

        let export = node.audit_export("json", true).unwrap();
        assert_eq!(export.count, 1);
        assert!(export.signature.is_some());
    }
}
