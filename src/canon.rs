//! Canonical JSON encoding and the hash/key-hash primitives built on it.
//!
//! `canonical_json` is the single serialization used for hashing and signing
//! throughout this crate: sorted keys, no whitespace, UTF-8 string output,
//! so two peers hash the same logical value to the same bytes regardless of
//! field insertion order. `serde_json::Map` is a `BTreeMap` as long as the
//! `preserve_order` feature is not enabled (it isn't, here), so object keys
//! sort themselves on serialize; combined with `serde_json`'s compact
//! formatter (no whitespace) and UTF-8 string output, `serde_json::to_vec`
//! already produces the canonical form.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Encodes a JSON value as canonical bytes: recursively sorted keys, `,`/`:`
/// separators with no whitespace, UTF-8 strings without non-ASCII escaping.
pub fn canonical_json(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("serde_json::Value serialization cannot fail")
}

/// Serializes `value` to a JSON `Value` then canonicalizes it.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    Ok(canonical_json(&v))
}

/// Lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `key_hash(pub_bytes) = sha256_hex(pub_bytes)` — the stable opaque signer
/// identity derived from a raw 32-byte Ed25519 public key.
pub fn key_hash(pub_bytes: &[u8]) -> String {
    sha256_hex(pub_bytes)
}

/// 32 zero bytes, hex-encoded — the resolved empty-feed `chain_head`/`H_0` seed.
pub fn zero_hash_hex() -> String {
    hex::encode([0u8; 32])
}

/// `sha256_hex` of the empty byte string — the resolved empty-Merkle-list root.
pub fn empty_root_hex() -> String {
    sha256_hex(b"")
}

/// ISO-8601 UTC timestamp serialization with a `Z` suffix, used via
/// `#[serde(with = "crate::canon::timestamp")]`.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    /// Formats `dt` as `YYYY-MM-DDTHH:MM:SS[.ffffff]Z` in UTC.
    pub fn to_iso_z(dt: OffsetDateTime) -> String {
        let utc = dt.to_offset(time::UtcOffset::UTC);
        let formatted = utc.format(&Rfc3339).expect("valid datetime always formats");
        match formatted.strip_suffix("+00:00") {
            Some(stripped) => format!("{stripped}Z"),
            None => formatted,
        }
    }

    /// Parses an ISO-8601 UTC timestamp (accepting either a `Z` or a
    /// numeric-offset suffix, since RFC 3339 permits both).
    pub fn from_iso(input: &str) -> Result<OffsetDateTime, time::error::Parse> {
        OffsetDateTime::parse(input, &Rfc3339)
    }

    pub fn serialize<S>(dt: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&to_iso_z(*dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        from_iso(&raw).map_err(serde::de::Error::custom)
    }

    /// The same scheme for `Option<OffsetDateTime>` fields.
    pub mod option {
        use super::{from_iso, to_iso_z};
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S>(dt: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match dt {
                Some(dt) => serializer.serialize_some(&to_iso_z(*dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw: Option<String> = Option::deserialize(deserializer)?;
            match raw {
                Some(s) => from_iso(&s).map(Some).map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
