//! Merkle commitments over a block's votes.
//!
//! Leaves are `double_hash(canonicalize(tx))` in block order and internal nodes
//! are `double_hash(left || right)`.  A level with an odd number of nodes pairs
//! its last node with itself.  A single leaf is its own root.

use serde_json::json;

use crate::canonical::{digest_from_hex, digest_to_hex, double_hash, Digest};
use crate::error::LedgerError;
use crate::vote::VoteTransaction;

fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    double_hash(&buf)
}

/// Root of the tree over zero transactions.
pub fn empty_root() -> Digest {
    double_hash(b"")
}

/// Leaf digests for `transactions`, in order.
pub fn leaf_hashes(transactions: &[VoteTransaction]) -> Result<Vec<Digest>, LedgerError> {
    transactions.iter().map(VoteTransaction::leaf_hash).collect()
}

fn next_level(level: &[Digest]) -> Vec<Digest> {
    level
        .chunks(2)
        .map(|chunk| match chunk {
            [left, right] => hash_pair(left, right),
            [single] => hash_pair(single, single),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Computes the root over precomputed leaf digests.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return empty_root();
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Computes the Merkle root over `transactions`.
pub fn build(transactions: &[VoteTransaction]) -> Result<Digest, LedgerError> {
    Ok(merkle_root(&leaf_hashes(transactions)?))
}

/// Describes a sibling hash encountered while walking a Merkle tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProofNode {
    /// Sibling digest that must be paired with the running hash.
    pub sibling: Digest,
    /// `true` if the sibling is on the left-hand side of the pair.
    pub left: bool,
}

/// Inclusion proof for a single vote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Root the proof was built against.
    pub root: Digest,
    /// Leaf digest whose inclusion is being proven.
    pub leaf: Digest,
    /// Position of the leaf within the block's vote list.
    pub index: usize,
    /// Sibling path from the leaf up to the root.
    pub path: Vec<MerkleProofNode>,
}

/// Constructs an inclusion proof for the leaf at `index` within `leaves`.
pub fn build_proof(leaves: &[Digest], index: usize) -> Option<MerkleProof> {
    if leaves.is_empty() || index >= leaves.len() {
        return None;
    }
    let mut layer = leaves.to_vec();
    let mut idx = index;
    let mut path = Vec::new();
    while layer.len() > 1 {
        if idx % 2 == 0 {
            let sibling = layer.get(idx + 1).copied().unwrap_or(layer[idx]);
            path.push(MerkleProofNode {
                sibling,
                left: false,
            });
        } else {
            path.push(MerkleProofNode {
                sibling: layer[idx - 1],
                left: true,
            });
        }
        layer = next_level(&layer);
        idx /= 2;
    }
    Some(MerkleProof {
        root: layer[0],
        leaf: leaves[index],
        index,
        path,
    })
}

/// Inclusion proof for `transactions[index]`.
pub fn proof(
    transactions: &[VoteTransaction],
    index: usize,
) -> Result<Option<MerkleProof>, LedgerError> {
    Ok(build_proof(&leaf_hashes(transactions)?, index))
}

/// Recomputes the root from `leaf` along the proof path.
///
/// The sibling directions must agree with `proof.index`, so a genuine leaf
/// presented at the wrong position is rejected.
pub fn verify_proof(leaf: &Digest, proof: &MerkleProof, claimed_root: &Digest) -> bool {
    let mut hash = *leaf;
    let mut idx = proof.index;
    for node in &proof.path {
        if node.left != (idx % 2 == 1) {
            return false;
        }
        hash = if node.left {
            hash_pair(&node.sibling, &hash)
        } else {
            hash_pair(&hash, &node.sibling)
        };
        idx /= 2;
    }
    idx == 0 && hash == *claimed_root
}

impl MerkleProof {
    /// Checks the proof against its own recorded leaf and root.
    pub fn verify(&self) -> bool {
        verify_proof(&self.leaf, self, &self.root)
    }

    /// Serialises the proof to a JSON value with hex-encoded digests.
    pub fn to_json(&self) -> serde_json::Value {
        let path: Vec<_> = self
            .path
            .iter()
            .map(|node| {
                json!({
                    "direction": if node.left { "L" } else { "R" },
                    "sibling": digest_to_hex(&node.sibling)
                })
            })
            .collect();
        json!({
            "root": digest_to_hex(&self.root),
            "leaf": digest_to_hex(&self.leaf),
            "index": self.index,
            "path": path
        })
    }

    /// Serialises the proof to a JSON string with hex-encoded digests.
    pub fn to_json_string(&self) -> String {
        self.to_json().to_string()
    }

    /// Parses a proof previously emitted by [`MerkleProof::to_json_string`].
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(input).map_err(|err| format!("invalid proof JSON: {err}"))?;
        let root = digest_from_hex(
            value
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing root".to_string())?,
        )?;
        let leaf = digest_from_hex(
            value
                .get("leaf")
                .and_then(|v| v.as_str())
                .ok_or_else(|| "missing leaf".to_string())?,
        )?;
        let index = value
            .get("index")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| "missing index".to_string())? as usize;
        let mut path = Vec::new();
        if let Some(array) = value.get("path").and_then(|v| v.as_array()) {
            for node in array {
                let direction = node
                    .get("direction")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "invalid direction".to_string())?;
                let left = match direction {
                    "L" | "l" => true,
                    "R" | "r" => false,
                    other => return Err(format!("invalid direction {other}")),
                };
                let sibling = digest_from_hex(
                    node.get("sibling")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| "invalid sibling".to_string())?,
                )?;
                path.push(MerkleProofNode { sibling, left });
            }
        }
        Ok(Self {
            root,
            leaf,
            index,
            path,
        })
    }
}
