//! Crate-wide error type carrying the machine-readable taxonomy from the
//! external-interface error contract, alongside small per-component errors.

use thiserror::Error;

/// Specific reason a bundle or policy update failed a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyViolationKind {
    /// A claim's predicate is not in `allowed_predicates`.
    PredicateNotAllowed,
    /// `window_days` exceeds `max_window_days`.
    WindowExceeded,
    /// Issuer key hash is in `issuer_blocklist`.
    IssuerBlocked,
    /// Issuer key hash is not in a required/non-empty `issuer_allowlist`.
    IssuerNotAllowlisted,
    /// Issuer id is blocked or not allowlisted.
    IssuerIdNotAllowed,
    /// `submission_quota_per_day` exceeded.
    QuotaExceeded,
}

impl PolicyViolationKind {
    /// The machine string suffix used after `policy_violation:`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PredicateNotAllowed => "predicate_not_allowed",
            Self::WindowExceeded => "window_exceeded",
            Self::IssuerBlocked => "issuer_blocked",
            Self::IssuerNotAllowlisted => "issuer_not_allowlisted",
            Self::IssuerIdNotAllowed => "issuer_id_not_allowed",
            Self::QuotaExceeded => "quota_exceeded",
        }
    }
}

impl std::fmt::Display for PolicyViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "policy_violation:{}", self.code())
    }
}

/// The crate-wide error type. Every variant maps to a stable machine string
/// via [`TrustError::code`] so callers can match without parsing `Display`.
#[derive(Debug, Error)]
pub enum TrustError {
    /// `village_id` failed the `^[A-Za-z0-9_-]+$` validation.
    #[error("invalid village id: {0}")]
    InvalidVillageId(String),
    /// The requested resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Bearer token absent/invalid/revoked, or role lacks the capability.
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Rate-limit bucket exceeded.
    #[error("rate limited")]
    RateLimited,
    /// Bundle or update signature failed verification, or a hash mismatched.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// Policy enforcement rejected the artifact for a specific reason.
    #[error("{0}")]
    PolicyViolation(PolicyViolationKind),
    /// A quorum verifier did not reach its required threshold.
    #[error("quorum not met (valid={valid} required={required})")]
    QuorumNotMet {
        /// Distinct valid signers counted.
        valid: usize,
        /// Threshold required to pass.
        required: usize,
    },
    /// A quorum verifier was given an invalid configuration (m < 1, weight <= 0).
    #[error("invalid quorum threshold: {0}")]
    InvalidQuorumConfig(String),
    /// Duplicate `bundle_id`.
    #[error("replay detected")]
    Replay,
    /// Decode/parse failure on untrusted input.
    #[error("decode error: {0}")]
    Decode(String),
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(String),
}

impl TrustError {
    /// The stable machine string from the error taxonomy.
    pub fn code(&self) -> String {
        match self {
            Self::InvalidVillageId(_) => "invalid_village_id".to_string(),
            Self::NotFound(_) => "not_found".to_string(),
            Self::Forbidden(_) => "forbidden".to_string(),
            Self::RateLimited => "rate_limited".to_string(),
            Self::InvalidSignature(_) => "invalid_signature".to_string(),
            Self::PolicyViolation(kind) => kind.to_string(),
            Self::QuorumNotMet { .. } => "quorum_not_met".to_string(),
            Self::InvalidQuorumConfig(_) => "quorum_not_met".to_string(),
            Self::Replay => "replay".to_string(),
            Self::Decode(_) => "decode_error".to_string(),
            Self::Io(_) => "io_error".to_string(),
        }
    }
}

impl From<std::io::Error> for TrustError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TrustError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_violation_code_matches_taxonomy() {
        let err = TrustError::PolicyViolation(PolicyViolationKind::WindowExceeded);
        assert_eq!(err.code(), "policy_violation:window_exceeded");
    }

    #[test]
    fn quorum_not_met_carries_counts() {
        let err = TrustError::QuorumNotMet {
            valid: 1,
            required: 2,
        };
        assert_eq!(err.to_string(), "quorum not met (valid=1 required=2)");
        assert_eq!(err.code(), "quorum_not_met");
    }
}
