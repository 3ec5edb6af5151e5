//! Feed-manifest Merkle root and hash-chain head over an ordered list of
//! `update_hash` values.
//!
//! An odd-sized layer duplicates its last node and hashes the pair
//! (`sha256(h3‖h3)`) rather than carrying the unpaired node forward
//! unhashed.

use sha2::{Digest, Sha256};

fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Unbalanced binary Merkle root over `leaves`. An odd-sized layer of two or
/// more nodes duplicates (and hashes) its last node. An empty list yields
/// `SHA-256("")`; a single-leaf list yields that leaf unchanged — there is
/// no sibling to pair it against.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(b"");
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        return out;
    }
    let mut layer: Vec<[u8; 32]> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            let hashed = if pair.len() == 2 {
                hash_pair(&pair[0], &pair[1])
            } else {
                hash_pair(&pair[0], &pair[0])
            };
            next.push(hashed);
        }
        layer = next;
    }
    layer[0]
}

/// Hex-encoded [`merkle_root`].
pub fn merkle_root_hex(leaves: &[[u8; 32]]) -> String {
    hex::encode(merkle_root(leaves))
}

/// Iterated hash chain `H_i = SHA-256(H_{i-1} || leaf_i)`, `H_0` = 32 zero
/// bytes. An empty list yields the zero seed itself, not a hash of it.
pub fn chain_head(leaves: &[[u8; 32]]) -> [u8; 32] {
    let mut head = [0u8; 32];
    for leaf in leaves {
        head = hash_pair(&head, leaf);
    }
    head
}

/// Hex-encoded [`chain_head`].
pub fn chain_head_hex(leaves: &[[u8; 32]]) -> String {
    hex::encode(chain_head(leaves))
}

/// Parses a lowercase hex SHA-256 digest into its raw bytes.
pub fn hash_from_hex(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}
