//! Per-election chains and full-chain re-validation.
//!
//! A chain only grows through [`Chain::append`].  [`Chain::validate_full`] walks
//! every block and every vote, records one [`ChainIssue`] per failure and never
//! repairs anything.

use log::{info, warn};
#[cfg(not(target_arch = "wasm32"))]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::block::{Block, BlockFault};
use crate::canonical::digest_from_hex;
use crate::error::LedgerError;
use crate::merkle;
use crate::vote::VoteTransaction;

/// Threat classes reported to auditors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatKind {
    /// Block content altered without re-mining.
    HashMismatch,
    /// A vote signature does not match its content or signer.
    InvalidSignature,
    /// Block votes do not match the committed content.
    TamperedBlock,
    /// Linkage or ordering discontinuity.
    BrokenChain,
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::HashMismatch => "HASH_MISMATCH",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::TamperedBlock => "TAMPERED_BLOCK",
            Self::BrokenChain => "BROKEN_CHAIN",
        };
        f.write_str(label)
    }
}

/// What a single validation check found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    /// Stored Merkle root differs from the root over the stored votes.
    MerkleMismatch,
    /// Stored hash differs from the recomputed hash.
    HashMismatch,
    /// Recomputed hash does not meet the difficulty target.
    DifficultyNotMet,
    /// `previousHash` does not equal the preceding block's hash.
    BrokenLinkage,
    /// Block index does not match its position.
    IndexMismatch,
    /// The first block is not a well-formed genesis block.
    InvalidGenesis,
    /// A block or vote names a different election.
    ElectionMismatch,
    /// A vote signature failed to verify.
    InvalidSignature,
    /// A vote id does not match its ballot content.
    VoteIdMismatch,
    /// A voter key appears more than once in the chain.
    DuplicateVote,
    /// A Merkle inclusion proof failed to verify.
    InclusionFailure,
}

impl IssueKind {
    /// Threat class the issue is reported under.
    pub fn threat(self) -> ThreatKind {
        match self {
            Self::HashMismatch | Self::DifficultyNotMet => ThreatKind::HashMismatch,
            Self::InvalidSignature => ThreatKind::InvalidSignature,
            Self::MerkleMismatch
            | Self::ElectionMismatch
            | Self::VoteIdMismatch
            | Self::DuplicateVote
            | Self::InclusionFailure => ThreatKind::TamperedBlock,
            Self::BrokenLinkage | Self::IndexMismatch | Self::InvalidGenesis => {
                ThreatKind::BrokenChain
            }
        }
    }
}

impl From<BlockFault> for IssueKind {
    fn from(fault: BlockFault) -> Self {
        match fault {
            BlockFault::MerkleMismatch => Self::MerkleMismatch,
            BlockFault::HashMismatch => Self::HashMismatch,
            BlockFault::DifficultyNotMet => Self::DifficultyNotMet,
        }
    }
}

/// One validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainIssue {
    /// Position of the offending block in the chain.
    pub block_index: u64,
    /// Offending vote, for vote-level checks.
    pub vote_id: Option<String>,
    /// Which check failed.
    pub kind: IssueKind,
    /// Threat classification of the failure.
    pub threat: ThreatKind,
    /// Human-readable description.
    pub detail: String,
}

impl ChainIssue {
    fn block(block_index: u64, kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            block_index,
            vote_id: None,
            kind,
            threat: kind.threat(),
            detail: detail.into(),
        }
    }

    fn vote(block_index: u64, vote_id: &str, kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            vote_id: Some(vote_id.to_string()),
            ..Self::block(block_index, kind, detail)
        }
    }
}

/// Structured report produced by [`Chain::validate_full`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainValidationResult {
    /// `true` when no issue was found.
    pub is_valid: bool,
    /// Every issue found, ordered by block.
    pub errors: Vec<ChainIssue>,
    /// Number of blocks inspected.
    pub total_blocks: usize,
    /// Number of blocks without any issue.
    pub valid_blocks: usize,
}

impl ChainValidationResult {
    /// Issues attributed to the block at `index`.
    pub fn issues_at(&self, index: u64) -> impl Iterator<Item = &ChainIssue> {
        self.errors.iter().filter(move |e| e.block_index == index)
    }

    /// Whether an issue of `kind` was reported for the block at `index`.
    pub fn has_issue(&self, index: u64, kind: IssueKind) -> bool {
        self.issues_at(index).any(|e| e.kind == kind)
    }
}

/// Knobs for [`Chain::validate_full`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Re-verify every vote signature.
    pub verify_signatures: bool,
    /// Spot-check Merkle inclusion proofs in each block.
    pub verify_inclusion: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            verify_inclusion: true,
        }
    }
}

/// Ordered blocks for one election.
///
/// Blocks are shared behind `Arc`, so cloning a chain is a cheap snapshot.
#[derive(Debug, Clone)]
pub struct Chain {
    election_id: String,
    difficulty: usize,
    blocks: Vec<Arc<Block>>,
}

impl Chain {
    /// Creates a chain with a freshly mined genesis block.
    pub fn new(election_id: &str, difficulty: usize) -> Result<Self, LedgerError> {
        let genesis = Block::genesis(election_id, difficulty)?;
        info!(
            "QSYS|mod=CHAIN|evt=GENESIS|election={}|hash={}",
            election_id, genesis.hash
        );
        Ok(Self {
            election_id: election_id.to_string(),
            difficulty,
            blocks: vec![Arc::new(genesis)],
        })
    }

    /// Wraps externally supplied blocks without checking them.
    ///
    /// Used for persisted chains; run [`Chain::validate_full`] before trusting
    /// the result.
    pub fn from_blocks(election_id: &str, difficulty: usize, blocks: Vec<Block>) -> Self {
        Self {
            election_id: election_id.to_string(),
            difficulty,
            blocks: blocks.into_iter().map(Arc::new).collect(),
        }
    }

    /// Election this chain belongs to.
    pub fn election_id(&self) -> &str {
        &self.election_id
    }

    /// Difficulty every block must meet.
    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Blocks in chain order.
    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// Number of blocks including genesis.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// `true` only for an externally supplied chain with no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The most recent block.
    pub fn head(&self) -> Option<&Arc<Block>> {
        self.blocks.last()
    }

    /// Hash the next block must reference.
    pub fn head_hash(&self) -> &str {
        self.head()
            .map(|block| block.hash.as_str())
            .unwrap_or(crate::block::GENESIS_PREVIOUS_HASH)
    }

    /// Appends a mined block after checking linkage and block validity.
    pub fn append(&mut self, block: Block) -> Result<Arc<Block>, LedgerError> {
        let head_hash = self.head_hash().to_string();
        if block.previous_hash != head_hash || block.index != self.blocks.len() as u64 {
            return Err(LedgerError::BrokenLinkage {
                index: block.index,
                expected: head_hash,
                found: block.previous_hash,
            });
        }
        if block.election_id != self.election_id {
            return Err(LedgerError::ElectionMismatch {
                requested: self.election_id.clone(),
                ballot: block.election_id,
            });
        }
        if let Some(fault) = block.validate(self.difficulty).first_fault() {
            return Err(LedgerError::from_fault(block.index, fault, self.difficulty));
        }
        let block = Arc::new(block);
        self.blocks.push(Arc::clone(&block));
        Ok(block)
    }

    /// Iterates every sealed vote with the index of its block.
    pub fn votes(&self) -> impl Iterator<Item = (u64, &VoteTransaction)> {
        self.blocks
            .iter()
            .flat_map(|block| block.votes.iter().map(move |tx| (block.index, tx)))
    }

    /// Locates a sealed vote by id.
    pub fn find_vote(&self, vote_id: &str) -> Option<(&Arc<Block>, usize)> {
        self.blocks
            .iter()
            .find_map(|block| block.position_of(vote_id).map(|pos| (block, pos)))
    }

    /// Whether a vote from `voter` has been sealed.
    pub fn contains_voter(&self, voter: &str) -> bool {
        self.votes().any(|(_, tx)| tx.voter_public_key == voter)
    }

    /// Per-candidate counts over sealed votes.
    pub fn tally(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for (_, tx) in self.votes() {
            *counts.entry(tx.candidate_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Re-validates the whole chain and reports every failure found.
    pub fn validate_full(&self, options: ValidationOptions) -> ChainValidationResult {
        let mut errors = Vec::new();

        if self.blocks.is_empty() {
            errors.push(ChainIssue::block(
                0,
                IssueKind::InvalidGenesis,
                "chain has no genesis block",
            ));
        }

        let mut seen_voters = HashSet::new();
        for (position, block) in self.blocks.iter().enumerate() {
            let at = position as u64;
            if position == 0 {
                if !block.is_genesis_shaped() {
                    errors.push(ChainIssue::block(
                        at,
                        IssueKind::InvalidGenesis,
                        "first block is not a genesis block",
                    ));
                }
            } else {
                if block.index != at {
                    errors.push(ChainIssue::block(
                        at,
                        IssueKind::IndexMismatch,
                        format!("block at position {at} carries index {}", block.index),
                    ));
                }
                let previous = &self.blocks[position - 1];
                if block.previous_hash != previous.hash {
                    errors.push(ChainIssue::block(
                        at,
                        IssueKind::BrokenLinkage,
                        format!(
                            "previous hash {} does not match block {} hash {}",
                            block.previous_hash,
                            position - 1,
                            previous.hash
                        ),
                    ));
                }
            }
            if block.election_id != self.election_id {
                errors.push(ChainIssue::block(
                    at,
                    IssueKind::ElectionMismatch,
                    format!("block belongs to election {}", block.election_id),
                ));
            }

            let report = block.validate(self.difficulty);
            for fault in &report.faults {
                errors.push(ChainIssue::block(at, (*fault).into(), fault.to_string()));
            }

            for tx in &block.votes {
                if tx.election_id != self.election_id {
                    errors.push(ChainIssue::vote(
                        at,
                        &tx.vote_id,
                        IssueKind::ElectionMismatch,
                        format!("vote cast in election {}", tx.election_id),
                    ));
                }
                if !tx.vote_id_matches() {
                    errors.push(ChainIssue::vote(
                        at,
                        &tx.vote_id,
                        IssueKind::VoteIdMismatch,
                        "vote id does not match ballot content",
                    ));
                }
                if !seen_voters.insert(tx.voter_public_key.as_str()) {
                    errors.push(ChainIssue::vote(
                        at,
                        &tx.vote_id,
                        IssueKind::DuplicateVote,
                        "voter key already appears earlier in the chain",
                    ));
                }
            }

            if options.verify_inclusion {
                errors.extend(spot_check_inclusion(at, block));
            }
        }

        if options.verify_signatures {
            errors.extend(self.signature_issues());
        }
        errors.sort_by_key(|issue| issue.block_index);

        let total_blocks = self.blocks.len();
        let flagged: HashSet<u64> = errors.iter().map(|e| e.block_index).collect();
        let valid_blocks = (0..total_blocks as u64)
            .filter(|idx| !flagged.contains(idx))
            .count();
        let result = ChainValidationResult {
            is_valid: errors.is_empty(),
            errors,
            total_blocks,
            valid_blocks,
        };
        if result.is_valid {
            info!(
                "QSYS|mod=CHAIN|evt=VALIDATE|election={}|blocks={}|valid={}",
                self.election_id, result.total_blocks, result.valid_blocks
            );
        } else {
            warn!(
                "QSYS|mod=CHAIN|evt=TAMPER|election={}|blocks={}|valid={}|errors={}",
                self.election_id,
                result.total_blocks,
                result.valid_blocks,
                result.errors.len()
            );
        }
        result
    }

    fn signature_issues(&self) -> Vec<ChainIssue> {
        let votes: Vec<(u64, &VoteTransaction)> = self.votes().collect();
        let check = |(at, tx): &(u64, &VoteTransaction)| {
            (!tx.verify_signature()).then(|| {
                ChainIssue::vote(
                    *at,
                    &tx.vote_id,
                    IssueKind::InvalidSignature,
                    "signature does not verify for the claimed voter",
                )
            })
        };
        #[cfg(not(target_arch = "wasm32"))]
        {
            votes.par_iter().filter_map(check).collect()
        }
        #[cfg(target_arch = "wasm32")]
        {
            votes.iter().filter_map(check).collect()
        }
    }
}

/// Proves the first, middle and last vote of a block against its stored root.
///
/// Each sampled vote is hashed on its own and walked up a proof to the root the
/// block committed to, so a stored root that no longer covers the votes names
/// the sampled vote ids.
fn spot_check_inclusion(at: u64, block: &Block) -> Vec<ChainIssue> {
    if block.votes.is_empty() {
        return Vec::new();
    }
    let root = match digest_from_hex(&block.merkle_root) {
        Ok(root) => root,
        Err(err) => {
            return vec![ChainIssue::block(at, IssueKind::InclusionFailure, err)];
        }
    };
    let leaves = match merkle::leaf_hashes(&block.votes) {
        Ok(leaves) => leaves,
        Err(err) => {
            return vec![ChainIssue::block(
                at,
                IssueKind::InclusionFailure,
                err.to_string(),
            )];
        }
    };
    let last = leaves.len() - 1;
    let mut samples = vec![0, last / 2, last];
    samples.dedup();
    samples
        .into_iter()
        .filter_map(|pos| {
            let tx = &block.votes[pos];
            let ok = match (tx.leaf_hash(), merkle::build_proof(&leaves, pos)) {
                (Ok(leaf), Some(proof)) => merkle::verify_proof(&leaf, &proof, &root),
                _ => false,
            };
            (!ok).then(|| {
                ChainIssue::vote(
                    at,
                    &tx.vote_id,
                    IssueKind::InclusionFailure,
                    format!("inclusion proof for position {pos} does not reach the merkle root"),
                )
            })
        })
        .collect()
}
