//! The shared append-only audit log for a store, plus its export to signed
//! JSON/CSV snapshots.
//!
//! Every `policy_hash` field recorded here is the full, untruncated hex
//! digest: every other `policy_hash` field in this crate is untruncated too,
//! and a peer comparing hashes across artifacts needs them to agree.

use crate::canon::{canonical_json, sha256_hex, timestamp};
use crate::crypto;
use crate::fslock::append_line_locked;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// One row in `audit/audit.log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event was recorded.
    #[serde(with = "timestamp")]
    pub ts: OffsetDateTime,
    /// `ingest.accept` | `ingest.reject` | `ingest.quarantine` |
    /// `quarantine.approve` | `quarantine.reject` | `member.revoke` |
    /// `member.rotate` | `member.add` | `issuer.allow` | `issuer.block`.
    pub action: String,
    /// The bundle this event concerns, if any.
    #[serde(default)]
    pub bundle_id: Option<String>,
    /// The village this event concerns, if any.
    #[serde(default)]
    pub village_id: Option<String>,
    /// The issuer key hash this event concerns, if any.
    #[serde(default)]
    pub issuer_key_hash: Option<String>,
    /// Who performed the action, if known.
    #[serde(default)]
    pub actor: Option<String>,
    /// Human-readable reason, verbatim.
    #[serde(default)]
    pub reason: Option<String>,
    /// The acting policy hash, when relevant.
    #[serde(default)]
    pub policy_hash: Option<String>,
}

fn audit_log_path(store_root: &Path) -> PathBuf {
    store_root.join("audit").join("audit.log.jsonl")
}

/// Appends `event` to the store's audit log under an exclusive lock.
/// Successful lock acquisitions, not arrival order, determine file order.
pub fn write_audit(store_root: &Path, event: &AuditEvent) -> io::Result<()> {
    let line = serde_json::to_string(event)?;
    append_line_locked(&audit_log_path(store_root), &line)
}

/// Reads every parseable event from the audit log, in file order. Malformed
/// lines are skipped so export stays resilient to partial writes from a
/// crashed peer.
pub fn iter_audit_events(store_root: &Path) -> io::Result<Vec<AuditEvent>> {
    let path = audit_log_path(store_root);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// `sha256_hex(bytes)[..16]` — the short policy digest used in tests and
/// ad-hoc tooling where the full digest is more than is needed.
pub fn short_policy_hash(policy_bytes: &[u8]) -> String {
    sha256_hex(policy_bytes)[..16].to_string()
}

/// Canonical JSON export: `{format, count, events}`. Returns the SHA-256 hex
/// digest of the written bytes and the event count.
pub fn export_audit_json(store_root: &Path, out_path: &Path) -> io::Result<(String, usize)> {
    let events = iter_audit_events(store_root)?;
    let payload = serde_json::json!({
        "format": "village_trust.audit.export.v1",
        "count": events.len(),
        "events": events,
    });
    let data = canonical_json(&payload);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, &data)?;
    Ok((sha256_hex(&data), events.len()))
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Flattened CSV export: `ts,action,village_id,actor,policy_hash,bundle_id,reason`.
/// Returns the SHA-256 hex digest of the written bytes and the event count.
pub fn export_audit_csv(store_root: &Path, out_path: &Path) -> io::Result<(String, usize)> {
    let events = iter_audit_events(store_root)?;
    let mut out = String::from("ts,action,village_id,actor,policy_hash,bundle_id,reason\n");
    for event in &events {
        let row = [
            timestamp::to_iso_z(event.ts),
            event.action.clone(),
            event.village_id.clone().unwrap_or_default(),
            event.actor.clone().unwrap_or_default(),
            event.policy_hash.clone().unwrap_or_default(),
            event.bundle_id.clone().unwrap_or_default(),
            event.reason.clone().unwrap_or_default(),
        ];
        out.push_str(&row.iter().map(|f| csv_escape(f)).collect::<Vec<_>>().join(","));
        out.push('\n');
    }
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(out_path, out.as_bytes())?;
    Ok((sha256_hex(out.as_bytes()), events.len()))
}

/// Signs a hex digest with the node key, used for `audit/export?sign=true`.
pub fn sign_digest_hex(digest_hex: &str, signing_key: &SigningKey) -> Result<String, crate::error::TrustError> {
    let bytes = hex::decode(digest_hex).map_err(|e| crate::error::TrustError::Decode(e.to_string()))?;
    let signature = crypto::sign_payload(signing_key, &bytes);
    Ok(crypto::encode_signature_base64(&signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;
    use tempfile::tempdir;

    fn ts(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000 + secs).unwrap()
    }

    fn accept_event(village: &str, bundle: &str) -> AuditEvent {
        AuditEvent {
            ts: ts(0),
            action: "ingest.accept".to_string(),
            bundle_id: Some(bundle.to_string()),
            village_id: Some(village.to_string()),
            issuer_key_hash: None,
            actor: None,
            reason: None,
            policy_hash: None,
        }
    }

    #[test]
    fn write_then_iter_preserves_order() {
        let dir = tempdir().unwrap();
        write_audit(dir.path(), &accept_event("v1", "b1")).unwrap();
        write_audit(dir.path(), &accept_event("v1", "b2")).unwrap();
        let events = iter_audit_events(dir.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].bundle_id.as_deref(), Some("b1"));
        assert_eq!(events[1].bundle_id.as_deref(), Some("b2"));
    }

    #[test]
    fn json_export_digest_is_stable_for_same_content() {
        let dir = tempdir().unwrap();
        write_audit(dir.path(), &accept_event("v1", "b1")).unwrap();
        let out = dir.path().join("export.json");
        let (digest_a, count_a) = export_audit_json(dir.path(), &out).unwrap();
        let (digest_b, count_b) = export_audit_json(dir.path(), &out).unwrap();
        assert_eq!(digest_a, digest_b);
        assert_eq!(count_a, 1);
        assert_eq!(count_b, 1);
    }

    #[test]
    fn csv_export_escapes_commas_in_reason() {
        let dir = tempdir().unwrap();
        let mut event = accept_event("v1", "b1");
        event.reason = Some("window_days=60, exceeds max".to_string());
        write_audit(dir.path(), &event).unwrap();
        let out = dir.path().join("export.csv");
        export_audit_csv(dir.path(), &out).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.contains("\"window_days=60, exceeds max\""));
    }

    #[test]
    fn digest_signing_round_trips() {
        let key = generate_signing_key();
        let digest = sha256_hex(b"hello");
        let sig_b64 = sign_digest_hex(&digest, &key).unwrap();
        let digest_bytes = hex::decode(&digest).unwrap();
        assert!(crypto::verify_signature_base64(
            &crypto::encode_public_key_base64(&key.verifying_key()),
            &digest_bytes,
            &sig_b64,
        )
        .unwrap());
    }
}
