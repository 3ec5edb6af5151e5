//! Bundle admission: the ingest state machine, quarantine/approve/reject,
//! the replay guard, and the claim index.
//!
//! A bundle is verified, checked against the village's current policy,
//! screened for replay, then either stored and indexed or quarantined with
//! a signed denial. Quarantined bundles stay reviewable: an operator with
//! the right capability can approve or reject them after the fact.

use crate::audit::{write_audit, AuditEvent};
use crate::bundle::{self, ClaimBundle};
use crate::canon::timestamp;
use crate::denial::{self, DenialArtifact, SubjectType};
use crate::error::{PolicyViolationKind, TrustError};
use crate::fslock::atomic_write;
use crate::policy::Policy;
use crate::village;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Date, OffsetDateTime};

/// What happened to a bundle submitted for admission.
#[derive(Debug, Clone)]
pub enum AdmissionOutcome {
    /// Verified, policy-admitted, stored, and indexed.
    Accepted {
        /// The accepted bundle's id.
        bundle_id: String,
        /// How many claim rows were appended to the index.
        claims_indexed: usize,
    },
    /// Passed verification but failed a policy check; held for re-review.
    Quarantined {
        /// The quarantined bundle's id.
        bundle_id: String,
        /// Why it was quarantined.
        reason: String,
    },
    /// Failed verification or replay detection outright; never persisted as
    /// an admitted artifact.
    Rejected {
        /// Why it was rejected.
        reason: String,
    },
}

fn bundles_dir(store_root: &Path, village_id: &str) -> PathBuf {
    store_root.join("bundles").join(village_id)
}

fn quarantine_dir(store_root: &Path, village_id: &str) -> PathBuf {
    store_root.join("quarantine").join(village_id)
}

fn rejected_dir(store_root: &Path, village_id: &str) -> PathBuf {
    store_root.join("rejected").join(village_id)
}

fn index_path(store_root: &Path) -> PathBuf {
    store_root.join("index").join("claims.jsonl")
}

/// One row appended to `index/claims.jsonl` per accepted claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClaimIndexRow {
    bundle_id: String,
    issuer: String,
    window_days: u64,
    #[serde(with = "timestamp")]
    created_at: OffsetDateTime,
    village_id: String,
    visibility: String,
    subject: String,
    predicate: String,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(with = "timestamp")]
    computed_at: OffsetDateTime,
}

/// Checks `bundle` against `policy`; the first violated rule is reported.
/// Does not consult the submission quota — that applies only at approve time.
fn check_policy(policy: &Policy, village_id: &str, bundle: &ClaimBundle) -> Result<(), PolicyViolationKind> {
    if !village::issuer_id_allowed(policy, &bundle.issuer) {
        return Err(PolicyViolationKind::IssuerIdNotAllowed);
    }
    if let Ok(Some(key_hash)) = bundle::issuer_key_hash(bundle) {
        if policy.issuer_blocklist().contains(&key_hash) {
            return Err(PolicyViolationKind::IssuerBlocked);
        }
        if !village::issuer_allowed(policy, &key_hash) {
            return Err(PolicyViolationKind::IssuerNotAllowlisted);
        }
    }
    let allowed_predicates = policy.allowed_predicates();
    for claim in &bundle.claims {
        if !allowed_predicates.contains(&claim.predicate) {
            return Err(PolicyViolationKind::PredicateNotAllowed);
        }
    }
    if let Some(max_window) = policy.max_window_days() {
        if bundle.window_days > max_window {
            return Err(PolicyViolationKind::WindowExceeded);
        }
    }
    let _ = village_id;
    Ok(())
}

fn human_reason(kind: PolicyViolationKind, policy: &Policy, bundle: &ClaimBundle) -> String {
    match kind {
        PolicyViolationKind::WindowExceeded => format!(
            "bundle window_days={} exceeds max_window_days={}",
            bundle.window_days,
            policy.max_window_days().unwrap_or_default()
        ),
        PolicyViolationKind::PredicateNotAllowed => "predicate not allowed".to_string(),
        PolicyViolationKind::IssuerBlocked => "issuer key hash blocked".to_string(),
        PolicyViolationKind::IssuerNotAllowlisted => "issuer key hash not allowlisted".to_string(),
        PolicyViolationKind::IssuerIdNotAllowed => "issuer id blocked or not allowlisted".to_string(),
        PolicyViolationKind::QuotaExceeded => "submission quota exceeded".to_string(),
    }
}

fn write_denial(
    store_root: &Path,
    village_id: &str,
    bundle_id: &str,
    reason: &str,
    node_key: Option<&SigningKey>,
    now: OffsetDateTime,
) -> std::io::Result<()> {
    let artifact = denial::build(
        village_id,
        SubjectType::Bundle,
        bundle_id,
        reason,
        None,
        serde_json::json!({}),
        node_key,
        now,
    );
    let dir = rejected_dir(store_root, village_id);
    fs::create_dir_all(&dir)?;
    denial::write(&dir.join(format!("{bundle_id}.denial.json")), &artifact)
}

/// Counts `quarantine.approve` audit events for `village_id` on the UTC
/// calendar day of `today`.
fn approvals_today(store_root: &Path, village_id: &str, today: Date) -> Result<u64, TrustError> {
    let events = crate::audit::iter_audit_events(store_root)?;
    Ok(events
        .iter()
        .filter(|e| {
            e.action == "quarantine.approve"
                && e.village_id.as_deref() == Some(village_id)
                && e.ts.date() == today
        })
        .count() as u64)
}

/// Runs the full admission pipeline: verify → policy check → replay guard →
/// store → index. `village_id` identifies both the policy to enforce and the
/// on-disk namespace under `store_root`.
pub fn ingest(
    store_root: &Path,
    village_id: &str,
    policy: &Policy,
    bundle: &ClaimBundle,
    node_key: Option<&SigningKey>,
    now: OffsetDateTime,
) -> Result<AdmissionOutcome, TrustError> {
    if !bundle::hash_matches(bundle) {
        write_audit(
            store_root,
            &AuditEvent {
                ts: now,
                action: "ingest.reject".to_string(),
                bundle_id: Some(bundle.bundle_id.clone()),
                village_id: Some(village_id.to_string()),
                issuer_key_hash: None,
                actor: None,
                reason: Some("bundle_id does not match content".to_string()),
                policy_hash: None,
            },
        )?;
        write_denial(
            store_root,
            village_id,
            &bundle.bundle_id,
            "bundle_id does not match content",
            node_key,
            now,
        )?;
        return Ok(AdmissionOutcome::Rejected {
            reason: "bundle_id does not match content".to_string(),
        });
    }
    if !bundle::verify_bundle(bundle) {
        write_audit(
            store_root,
            &AuditEvent {
                ts: now,
                action: "ingest.reject".to_string(),
                bundle_id: Some(bundle.bundle_id.clone()),
                village_id: Some(village_id.to_string()),
                issuer_key_hash: None,
                actor: None,
                reason: Some("signature verification failed".to_string()),
                policy_hash: None,
            },
        )?;
        write_denial(
            store_root,
            village_id,
            &bundle.bundle_id,
            "signature verification failed",
            node_key,
            now,
        )?;
        return Ok(AdmissionOutcome::Rejected {
            reason: "signature verification failed".to_string(),
        });
    }

    let issuer_key_hash = bundle::issuer_key_hash(bundle).ok().flatten();

    if let Err(kind) = check_policy(policy, village_id, bundle) {
        let reason = human_reason(kind, policy, bundle);
        let path = quarantine_dir(store_root, village_id).join(format!("{}.json", bundle.bundle_id));
        fs::create_dir_all(path.parent().unwrap())?;
        atomic_write(&path, &serde_json::to_vec_pretty(bundle)?)?;
        write_audit(
            store_root,
            &AuditEvent {
                ts: now,
                action: "ingest.quarantine".to_string(),
                bundle_id: Some(bundle.bundle_id.clone()),
                village_id: Some(village_id.to_string()),
                issuer_key_hash: issuer_key_hash.clone(),
                actor: None,
                reason: Some(reason.clone()),
                policy_hash: Some(policy.hash()),
            },
        )?;
        write_denial(store_root, village_id, &bundle.bundle_id, &reason, node_key, now)?;
        return Ok(AdmissionOutcome::Quarantined {
            bundle_id: bundle.bundle_id.clone(),
            reason,
        });
    }

    let bundle_path = bundles_dir(store_root, village_id).join(format!("{}.json", bundle.bundle_id));
    if bundle_path.exists() {
        write_audit(
            store_root,
            &AuditEvent {
                ts: now,
                action: "ingest.reject".to_string(),
                bundle_id: Some(bundle.bundle_id.clone()),
                village_id: Some(village_id.to_string()),
                issuer_key_hash: issuer_key_hash.clone(),
                actor: None,
                reason: Some("replay detected".to_string()),
                policy_hash: None,
            },
        )?;
        return Err(TrustError::Replay);
    }

    fs::create_dir_all(bundle_path.parent().unwrap())?;
    atomic_write(&bundle_path, &serde_json::to_vec_pretty(bundle)?)?;

    let claims_indexed = append_claim_rows(store_root, village_id, policy, bundle)?;

    write_audit(
        store_root,
        &AuditEvent {
            ts: now,
            action: "ingest.accept".to_string(),
            bundle_id: Some(bundle.bundle_id.clone()),
            village_id: Some(village_id.to_string()),
            issuer_key_hash,
            actor: None,
            reason: None,
            policy_hash: Some(policy.hash()),
        },
    )?;

    Ok(AdmissionOutcome::Accepted {
        bundle_id: bundle.bundle_id.clone(),
        claims_indexed,
    })
}

fn append_claim_rows(
    store_root: &Path,
    village_id: &str,
    policy: &Policy,
    bundle: &ClaimBundle,
) -> Result<usize, TrustError> {
    use crate::fslock::exclusive_lock;
    use std::io::Write;

    let path = index_path(store_root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let _guard = exclusive_lock(&path)?;
    let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    let visibility = format!("{:?}", policy.visibility()).to_lowercase();
    for claim in &bundle.claims {
        let row = ClaimIndexRow {
            bundle_id: bundle.bundle_id.clone(),
            issuer: bundle.issuer.clone(),
            window_days: bundle.window_days,
            created_at: bundle.created_at,
            village_id: village_id.to_string(),
            visibility: visibility.clone(),
            subject: claim.subject.clone(),
            predicate: claim.predicate.clone(),
            object: claim.object.clone(),
            value: claim.value.clone(),
            computed_at: claim.computed_at,
        };
        let line = serde_json::to_string(&row)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    Ok(bundle.claims.len())
}

/// Re-runs the full policy check against `policy` (the *current* policy, not
/// the one in force when the bundle was quarantined) and, if it now passes,
/// completes ingestion and removes the quarantine file. Submission quota is
/// enforced here, and only here.
pub fn approve_quarantined(
    store_root: &Path,
    village_id: &str,
    policy: &Policy,
    bundle_id: &str,
    node_key: Option<&SigningKey>,
    now: OffsetDateTime,
) -> Result<AdmissionOutcome, TrustError> {
    let path = quarantine_dir(store_root, village_id).join(format!("{bundle_id}.json"));
    let text = fs::read_to_string(&path).map_err(|_| TrustError::NotFound(bundle_id.to_string()))?;
    let bundle: ClaimBundle = serde_json::from_str(&text)?;

    let quota = policy.submission_quota_per_day();
    if quota > 0 {
        let used = approvals_today(store_root, village_id, now.date())?;
        if used >= quota {
            let reason = human_reason(PolicyViolationKind::QuotaExceeded, policy, &bundle);
            write_denial(store_root, village_id, bundle_id, &reason, node_key, now)?;
            return Ok(AdmissionOutcome::Quarantined {
                bundle_id: bundle_id.to_string(),
                reason,
            });
        }
    }

    if let Err(kind) = check_policy(policy, village_id, &bundle) {
        let reason = human_reason(kind, policy, &bundle);
        write_denial(store_root, village_id, bundle_id, &reason, node_key, now)?;
        return Ok(AdmissionOutcome::Quarantined {
            bundle_id: bundle_id.to_string(),
            reason,
        });
    }

    let bundle_path = bundles_dir(store_root, village_id).join(format!("{bundle_id}.json"));
    fs::create_dir_all(bundle_path.parent().unwrap())?;
    atomic_write(&bundle_path, &serde_json::to_vec_pretty(&bundle)?)?;
    let claims_indexed = append_claim_rows(store_root, village_id, policy, &bundle)?;
    fs::remove_file(&path)?;

    write_audit(
        store_root,
        &AuditEvent {
            ts: now,
            action: "quarantine.approve".to_string(),
            bundle_id: Some(bundle_id.to_string()),
            village_id: Some(village_id.to_string()),
            issuer_key_hash: bundle::issuer_key_hash(&bundle).ok().flatten(),
            actor: None,
            reason: None,
            policy_hash: Some(policy.hash()),
        },
    )?;

    Ok(AdmissionOutcome::Accepted {
        bundle_id: bundle_id.to_string(),
        claims_indexed,
    })
}

/// Moves a quarantined bundle to `rejected/` without re-checking policy — an
/// explicit operator decision, not a policy outcome.
pub fn reject_quarantined(
    store_root: &Path,
    village_id: &str,
    bundle_id: &str,
    reason: &str,
    actor: Option<&str>,
    now: OffsetDateTime,
) -> Result<(), TrustError> {
    let src = quarantine_dir(store_root, village_id).join(format!("{bundle_id}.json"));
    let text = fs::read_to_string(&src).map_err(|_| TrustError::NotFound(bundle_id.to_string()))?;
    let dst_dir = rejected_dir(store_root, village_id);
    fs::create_dir_all(&dst_dir)?;
    atomic_write(&dst_dir.join(format!("{bundle_id}.json")), text.as_bytes())?;
    fs::remove_file(&src)?;

    write_audit(
        store_root,
        &AuditEvent {
            ts: now,
            action: "quarantine.reject".to_string(),
            bundle_id: Some(bundle_id.to_string()),
            village_id: Some(village_id.to_string()),
            issuer_key_hash: None,
            actor: actor.map(String::from),
            reason: Some(reason.to_string()),
            policy_hash: None,
        },
    )?;
    Ok(())
}

/// The most recently created bundle on record for `village_id` (by
/// `created_at`, ties broken by `bundle_id`), ignoring quarantined and
/// rejected artifacts.
pub fn latest_bundle(store_root: &Path, village_id: &str) -> Result<Option<ClaimBundle>, TrustError> {
    let dir = bundles_dir(store_root, village_id);
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<ClaimBundle> = None;
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().map(|ext| ext != "json").unwrap_or(true) {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        let bundle: ClaimBundle = match serde_json::from_str(&text) {
            Ok(b) => b,
            Err(_) => continue,
        };
        let better = match &best {
            None => true,
            Some(current) => (bundle.created_at, &bundle.bundle_id) > (current.created_at, &current.bundle_id),
        };
        if better {
            best = Some(bundle);
        }
    }
    Ok(best)
}

/// Lists quarantined bundle ids for `village_id`, sorted.
pub fn list_quarantine(store_root: &Path, village_id: &str) -> std::io::Result<Vec<String>> {
    let dir = quarantine_dir(store_root, village_id);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut ids: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Claim;
    use crate::crypto::generate_signing_key;
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn sample_bundle(signing_key: &SigningKey, window_days: u64) -> ClaimBundle {
        let claim = Claim {
            issuer: "issuer-1".to_string(),
            subject: "a".to_string(),
            predicate: "links.weighted_to".to_string(),
            object: Some("b".to_string()),
            value: Some(json!(1.0)),
            window_days,
            computed_at: ts(0),
            derivation: None,
            evidence: Vec::new(),
        };
        let built = bundle::build("issuer-1", ts(0), window_days, vec![claim]);
        bundle::sign_bundle(built, signing_key)
    }

    #[test]
    fn accepts_a_valid_bundle_under_permissive_policy() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        let bundle = sample_bundle(&key, 30);
        let outcome = ingest(dir.path(), "v1", &policy, &bundle, None, ts(1)).unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Accepted { claims_indexed: 1, .. }));
    }

    #[test]
    fn quarantines_on_window_exceeded_s3() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        let bundle = sample_bundle(&key, 60);
        let outcome = ingest(dir.path(), "v1", &policy, &bundle, None, ts(1)).unwrap();
        match outcome {
            AdmissionOutcome::Quarantined { reason, .. } => {
                assert!(reason.contains("window_days=60"));
                assert!(reason.contains("max_window_days=30"));
            }
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn quarantine_approval_after_policy_widened_s3() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let narrow = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        let bundle = sample_bundle(&key, 60);
        ingest(dir.path(), "v1", &narrow, &bundle, None, ts(1)).unwrap();

        let widened = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 60}));
        let outcome = approve_quarantined(dir.path(), "v1", &widened, &bundle.bundle_id, None, ts(2)).unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Accepted { .. }));
        assert!(list_quarantine(dir.path(), "v1").unwrap().is_empty());
    }

    #[test]
    fn replay_is_rejected_on_second_ingest_s4() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let policy = Policy(json!({"allowed_predicates": ["links.weighted_to"], "max_window_days": 30}));
        let bundle = sample_bundle(&key, 30);
        ingest(dir.path(), "v1", &policy, &bundle, None, ts(1)).unwrap();
        let second = ingest(dir.path(), "v1", &policy, &bundle, None, ts(2));
        assert!(matches!(second, Err(TrustError::Replay)));
    }

    #[test]
    fn tampered_bundle_hash_is_rejected_not_quarantined() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let policy = Policy::empty();
        let mut bundle = sample_bundle(&key, 30);
        bundle.window_days = 999;
        let outcome = ingest(dir.path(), "v1", &policy, &bundle, None, ts(1)).unwrap();
        assert!(matches!(outcome, AdmissionOutcome::Rejected { .. }));
    }

    #[test]
    fn quarantine_quota_enforced_only_at_approve_time() {
        let dir = tempdir().unwrap();
        let key = generate_signing_key();
        let policy = Policy(json!({
            "allowed_predicates": ["links.weighted_to"],
            "max_window_days": 10,
            "submission_quota_per_day": 1,
        }));
        let over_window = sample_bundle(&key, 99);
        ingest(dir.path(), "v1", &policy, &over_window, None, ts(1)).unwrap();
        let approved = approve_quarantined(dir.path(), "v1", &policy, &over_window.bundle_id, None, ts(2));
        assert!(approved.is_ok());
    }
}
