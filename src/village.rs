//! Village records, membership, and policy application.
//!
//! Audit-event emission is left to callers (the admission pipeline and the
//! API layer) rather than woven into every mutation here, keeping this
//! module a pure store over `village.json`/`members.jsonl`/`revocations.jsonl`.

use crate::canon::{sha256_hex, timestamp};
use crate::error::TrustError;
use crate::fslock::{append_line_locked, atomic_write};
use crate::policy::{Capabilities, Policy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

/// Lightweight governance metadata; the binding authority remains the
/// policy's quorum configuration, not this list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VillageGovernance {
    /// Member ids considered administrators for out-of-band coordination.
    #[serde(default)]
    pub admins: Vec<String>,
    /// Free-text description of how admin decisions are made.
    #[serde(default = "default_decision_model")]
    pub decision_model: String,
}

fn default_decision_model() -> String {
    "admin-consensus".to_string()
}

/// A governed group: its identity, governance metadata, and current policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Village {
    /// Must match `^[A-Za-z0-9_-]+$`.
    pub village_id: String,
    /// Display name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// When the village was created.
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    /// Governance metadata.
    #[serde(default)]
    pub governance: VillageGovernance,
    /// The current policy in force.
    pub policy: Policy,
}

/// One append-only row in `members.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VillageMember {
    /// The member's stable identifier.
    pub member_id: String,
    /// `observer` | `member` | `admin`, or a custom role matching `capabilities`.
    #[serde(default = "default_role")]
    pub role: String,
    /// When this membership row was added.
    #[serde(with = "timestamp")]
    pub added_at: OffsetDateTime,
    /// `hex(SHA-256(bearer_token_bytes))`.
    pub token_hash: String,
    /// True once this specific row has been superseded by a revocation.
    /// Revocation is authoritative via `revocations.jsonl`; this flag mirrors
    /// it for readers that only scan `members.jsonl`.
    #[serde(default)]
    pub is_revoked: bool,
}

fn default_role() -> String {
    "member".to_string()
}

/// One append-only row in `revocations.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revocation {
    /// When the token was revoked.
    #[serde(with = "timestamp")]
    pub ts: OffsetDateTime,
    /// The revoked token's hash.
    pub token_hash: String,
    /// Who revoked it.
    #[serde(default)]
    pub actor: Option<String>,
    /// Free-text reason.
    pub reason: String,
}

fn village_dir(root: &Path, village_id: &str) -> PathBuf {
    root.join("villages").join(village_id)
}

fn village_json_path(root: &Path, village_id: &str) -> PathBuf {
    village_dir(root, village_id).join("village.json")
}

fn members_path(root: &Path, village_id: &str) -> PathBuf {
    village_dir(root, village_id).join("members.jsonl")
}

fn revocations_path(root: &Path, village_id: &str) -> PathBuf {
    village_dir(root, village_id).join("revocations.jsonl")
}

fn policy_history_path(root: &Path, village_id: &str) -> PathBuf {
    village_dir(root, village_id).join("policy_history.jsonl")
}

/// `hex(SHA-256(bearer_token_bytes))`.
pub fn hash_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Writes `village.json` atomically and ensures the append-only logs exist.
pub fn save_village(root: &Path, village: &Village) -> Result<PathBuf, TrustError> {
    let dir = village_dir(root, &village.village_id);
    fs::create_dir_all(&dir)?;
    let path = village_json_path(root, &village.village_id);
    let body = serde_json::to_vec_pretty(village)?;
    atomic_write(&path, &body)?;
    for log in [
        members_path(root, &village.village_id),
        revocations_path(root, &village.village_id),
    ] {
        if !log.exists() {
            fs::write(&log, b"")?;
        }
    }
    Ok(path)
}

/// Reads `village.json`.
pub fn load_village(root: &Path, village_id: &str) -> Result<Village, TrustError> {
    let path = village_json_path(root, village_id);
    let text = fs::read_to_string(&path).map_err(|_| TrustError::NotFound(village_id.to_string()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Appends a new member row and returns it. Errors if the village doesn't
/// exist yet.
pub fn add_member(
    root: &Path,
    village_id: &str,
    member_id: &str,
    role: &str,
    token_plain: &str,
    added_at: OffsetDateTime,
) -> Result<VillageMember, TrustError> {
    if !village_json_path(root, village_id).exists() {
        return Err(TrustError::NotFound(village_id.to_string()));
    }
    let member = VillageMember {
        member_id: member_id.to_string(),
        role: role.to_string(),
        added_at,
        token_hash: hash_token(token_plain),
        is_revoked: false,
    };
    let line = serde_json::to_string(&member)?;
    append_line_locked(&members_path(root, village_id), &line)?;
    Ok(member)
}

/// Reads every membership row for `village_id`, in file order.
pub fn list_members(root: &Path, village_id: &str) -> Result<Vec<VillageMember>, TrustError> {
    let path = members_path(root, village_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

/// True iff `token_hash` appears anywhere in `revocations.jsonl`.
pub fn is_token_revoked(root: &Path, village_id: &str, token_hash: &str) -> Result<bool, TrustError> {
    let path = revocations_path(root, village_id);
    if !path.exists() {
        return Ok(false);
    }
    let text = fs::read_to_string(&path)?;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Revocation = serde_json::from_str(line)?;
        if row.token_hash == token_hash {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Appends a revocation row under an exclusive lock.
pub fn revoke_token_hash(
    root: &Path,
    village_id: &str,
    token_hash: &str,
    actor: Option<&str>,
    reason: &str,
    ts: OffsetDateTime,
) -> Result<(), TrustError> {
    let row = Revocation {
        ts,
        token_hash: token_hash.to_string(),
        actor: actor.map(String::from),
        reason: reason.to_string(),
    };
    let line = serde_json::to_string(&row)?;
    append_line_locked(&revocations_path(root, village_id), &line)?;
    Ok(())
}

/// Hashes `bearer_token` and returns the matching un-revoked member, if any.
/// Revocation overrides membership: a revoked token never authorizes even
/// if its membership row still reads `is_revoked: false`.
pub fn authorize(root: &Path, village_id: &str, bearer_token: &str) -> Result<Option<VillageMember>, TrustError> {
    let wanted = hash_token(bearer_token);
    if is_token_revoked(root, village_id, &wanted)? {
        return Ok(None);
    }
    for member in list_members(root, village_id)? {
        if member.token_hash == wanted && !member.is_revoked {
            return Ok(Some(member));
        }
    }
    Ok(None)
}

/// Revokes every currently un-revoked token belonging to `member_id`.
/// Returns how many tokens were newly revoked.
pub fn revoke_member(
    root: &Path,
    village_id: &str,
    member_id: &str,
    actor: Option<&str>,
    reason: &str,
    ts: OffsetDateTime,
) -> Result<u32, TrustError> {
    let mut count = 0;
    for member in list_members(root, village_id)? {
        if member.member_id != member_id {
            continue;
        }
        if !is_token_revoked(root, village_id, &member.token_hash)? {
            revoke_token_hash(root, village_id, &member.token_hash, actor, reason, ts)?;
            count += 1;
        }
    }
    Ok(count)
}

/// Revokes `member_id`'s existing tokens and adds a fresh one under the same
/// (most recent) role.
pub fn rotate_member_token(
    root: &Path,
    village_id: &str,
    member_id: &str,
    new_token_plain: &str,
    actor: Option<&str>,
    ts: OffsetDateTime,
) -> Result<VillageMember, TrustError> {
    revoke_member(root, village_id, member_id, actor, "rotated", ts)?;
    let role = list_members(root, village_id)?
        .into_iter()
        .rev()
        .find(|m| m.member_id == member_id)
        .map(|m| m.role)
        .unwrap_or_else(default_role);
    add_member(root, village_id, member_id, &role, new_token_plain, ts)
}

/// `issuer_allowed` checks the issuer key hash against the village's
/// blocklist and allowlist: blocklist wins, then allowlist (required or
/// not), else allow.
pub fn issuer_allowed(policy: &Policy, issuer_key_hash: &str) -> bool {
    if policy.issuer_blocklist().contains(issuer_key_hash) {
        return false;
    }
    let allowlist = policy.issuer_allowlist();
    if policy.require_issuer_allowlist() || !allowlist.is_empty() {
        return allowlist.contains(issuer_key_hash);
    }
    true
}

/// Same shape as [`issuer_allowed`] but over `bundle.issuer` strings rather
/// than key hashes, and with no `require_*` escape hatch (blocklist, then
/// allowlist-if-non-empty, else allow).
pub fn issuer_id_allowed(policy: &Policy, issuer_id: &str) -> bool {
    if policy.issuer_id_blocklist().contains(issuer_id) {
        return false;
    }
    let allowlist = policy.issuer_id_allowlist();
    if !allowlist.is_empty() {
        return allowlist.contains(issuer_id);
    }
    true
}

/// Looks up `role` in `capabilities`, falling back to `observer`, and
/// returns the grant for `action` (`pull`/`push`/`manage`).
pub fn role_can(policy: &Policy, role: &str, action: &str) -> bool {
    let caps = policy.capabilities();
    let grant = caps.get(role).or_else(|| caps.get("observer"));
    let grant = match grant {
        Some(g) => *g,
        None => Capabilities::default(),
    };
    match action {
        "pull" => grant.can_pull,
        "push" => grant.can_push,
        "manage" => grant.can_manage,
        _ => false,
    }
}

/// Replaces the village's current policy and appends a row to
/// `policy_history.jsonl` recording the applied policy and metadata.
pub fn apply_policy_update(
    root: &Path,
    village_id: &str,
    policy: Policy,
    actor: Option<&str>,
    ts: OffsetDateTime,
) -> Result<(), TrustError> {
    let mut village = load_village(root, village_id)?;
    village.policy = policy.clone();
    save_village(root, &village)?;

    let row = serde_json::json!({
        "policy": policy.0,
        "actor": actor,
        "ts": crate::canon::timestamp::to_iso_z(ts),
    });
    let line = serde_json::to_string(&row)?;
    append_line_locked(&policy_history_path(root, village_id), &line)?;
    Ok(())
}
