//! Deterministic head selection and fork detection across peers.
//!
//! Head = `argmax (created_at, policy_hash)` over a feed's updates; forks
//! are groups of updates sharing a `previous_policy_hash`, and
//! `missing_local`/`missing_remote` are the set differences between two
//! peers' feeds.

use crate::policy_update::{self, LifecycleState, PolicyUpdate};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;

/// One child of a fork point.
#[derive(Debug, Clone, Serialize)]
pub struct ForkChild {
    /// The child's own `policy_hash`.
    pub policy_hash: String,
    /// The child's creation time.
    #[serde(with = "crate::canon::timestamp")]
    pub created_at: OffsetDateTime,
    /// The child's `update_hash`.
    pub update_hash: String,
    /// The child's lifecycle state.
    pub lifecycle_state: LifecycleState,
}

/// A group of ≥2 distinct updates sharing a `previous_policy_hash`.
#[derive(Debug, Clone, Serialize)]
pub struct Fork {
    /// The shared predecessor hash.
    pub previous_policy_hash: String,
    /// Children, sorted by `(created_at, policy_hash)`.
    pub children: Vec<ForkChild>,
}

/// Groups `updates` by `previous_policy_hash` and reports every group with
/// ≥2 distinct `policy_hash` children. Updates with no predecessor
/// (`previous_policy_hash = None`) can never fork and are excluded.
pub fn detect_forks(updates: &[PolicyUpdate]) -> Vec<Fork> {
    let mut by_prev: HashMap<String, Vec<&PolicyUpdate>> = HashMap::new();
    for update in updates {
        if let Some(prev) = &update.previous_policy_hash {
            by_prev.entry(prev.clone()).or_default().push(update);
        }
    }

    let mut forks: Vec<Fork> = Vec::new();
    for (prev, children) in by_prev {
        let distinct: BTreeSet<&str> = children.iter().map(|c| c.policy_hash.as_str()).collect();
        if distinct.len() <= 1 {
            continue;
        }
        let mut rows: Vec<ForkChild> = children
            .iter()
            .map(|c| ForkChild {
                policy_hash: c.policy_hash.clone(),
                created_at: c.created_at,
                update_hash: policy_update::compute_update_hash(c),
                lifecycle_state: c.lifecycle_state,
            })
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.policy_hash).cmp(&(b.created_at, &b.policy_hash)));
        forks.push(Fork {
            previous_policy_hash: prev,
            children: rows,
        });
    }
    forks.sort_by(|a, b| a.previous_policy_hash.cmp(&b.previous_policy_hash));
    forks
}

/// The result of comparing a local and a remote view of one village's feed.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// The village being compared.
    pub village_id: String,
    /// `argmax (created_at, policy_hash)` over `local`, if non-empty.
    pub local_head: Option<String>,
    /// `argmax (created_at, policy_hash)` over `remote`, if non-empty.
    pub remote_head: Option<String>,
    /// True iff the two heads differ.
    pub drift: bool,
    /// Forks found across the union of both views.
    pub forks: Vec<Fork>,
    /// `policy_hash`es present in `remote` but absent from `local`.
    pub missing_local: Vec<String>,
    /// `policy_hash`es present in `local` but absent from `remote`.
    pub missing_remote: Vec<String>,
}

fn head_of(updates: &[PolicyUpdate]) -> Option<String> {
    updates
        .iter()
        .max_by(|a, b| (a.created_at, &a.policy_hash).cmp(&(b.created_at, &b.policy_hash)))
        .map(|u| u.policy_hash.clone())
}

/// Compares `local` and `remote` views of `village_id`'s feed. Never
/// resolves a fork automatically — that would require a consensus
/// mechanism this crate doesn't implement — it only reports.
pub fn reconcile(local: &[PolicyUpdate], remote: &[PolicyUpdate], village_id: &str) -> ReconcileReport {
    let local_set: BTreeSet<&str> = local.iter().map(|u| u.policy_hash.as_str()).collect();
    let remote_set: BTreeSet<&str> = remote.iter().map(|u| u.policy_hash.as_str()).collect();

    let local_head = head_of(local);
    let remote_head = head_of(remote);

    let mut combined = Vec::with_capacity(local.len() + remote.len());
    combined.extend_from_slice(local);
    combined.extend_from_slice(remote);

    ReconcileReport {
        village_id: village_id.to_string(),
        drift: local_head != remote_head,
        local_head,
        remote_head,
        forks: detect_forks(&combined),
        missing_local: remote_set.difference(&local_set).map(|s| s.to_string()).collect(),
        missing_remote: local_set.difference(&remote_set).map(|s| s.to_string()).collect(),
    }
}
