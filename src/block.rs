//! Blocks: sealed batches of votes with a proof-of-work hash.

use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::canonical::{digest_to_hex, leading_zero_hex, Digest, NonceTemplate};
use crate::error::LedgerError;
use crate::merkle;
use crate::vote::VoteTransaction;

/// `previousHash` carried by every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const NONCE_KEY: &str = "nonce";

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Every block field except `nonce` and `hash`, in wire naming.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockContent<'a> {
    index: u64,
    previous_hash: &'a str,
    merkle_root: &'a str,
    timestamp: u64,
    election_id: &'a str,
    votes: &'a [VoteTransaction],
}

impl BlockContent<'_> {
    fn template(&self) -> Result<NonceTemplate, LedgerError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => {
                NonceTemplate::new(&fields, NONCE_KEY).map_err(LedgerError::Codec)
            }
            _ => Err(LedgerError::Codec("block content is not an object".into())),
        }
    }
}

/// A block that has been assembled but not yet mined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnminedBlock {
    /// Position in the election's chain.
    pub index: u64,
    /// Hash of the preceding block.
    pub previous_hash: String,
    /// Hex Merkle root over `votes`.
    pub merkle_root: String,
    /// Assembly time in Unix milliseconds.
    pub timestamp: u64,
    /// Election the block belongs to.
    pub election_id: String,
    /// Starting nonce for the search.
    pub nonce: u64,
    /// Votes in submission order.
    pub votes: Vec<VoteTransaction>,
}

/// A mined block, never mutated once appended to a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the election's chain (0 is genesis).
    pub index: u64,
    /// Hash of the preceding block, or [`GENESIS_PREVIOUS_HASH`].
    pub previous_hash: String,
    /// Hex Merkle root over `votes`.
    pub merkle_root: String,
    /// Assembly time in Unix milliseconds.
    pub timestamp: u64,
    /// Election the block belongs to.
    pub election_id: String,
    /// Nonce that satisfied the difficulty target.
    pub nonce: u64,
    /// Hex double hash of the canonical block content.
    pub hash: String,
    /// Votes in submission order.
    pub votes: Vec<VoteTransaction>,
}

/// A single reason a block failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockFault {
    /// The stored Merkle root does not match the stored votes.
    MerkleMismatch,
    /// The stored hash does not match the recomputed content hash.
    HashMismatch,
    /// The recomputed hash lacks the required leading zeros.
    DifficultyNotMet,
}

impl fmt::Display for BlockFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MerkleMismatch => write!(f, "merkle root does not match votes"),
            Self::HashMismatch => write!(f, "hash does not match block content"),
            Self::DifficultyNotMet => write!(f, "hash does not meet difficulty target"),
        }
    }
}

/// Outcome of [`Block::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockValidation {
    /// Every fault found, in check order.
    pub faults: Vec<BlockFault>,
}

impl BlockValidation {
    /// `true` when no fault was found.
    pub fn is_valid(&self) -> bool {
        self.faults.is_empty()
    }

    /// The first fault, if any.
    pub fn first_fault(&self) -> Option<BlockFault> {
        self.faults.first().copied()
    }
}

impl UnminedBlock {
    /// Assembles a block over `votes`, stamped with the current time.
    pub fn assemble(
        index: u64,
        previous_hash: String,
        election_id: String,
        votes: Vec<VoteTransaction>,
    ) -> Result<Self, LedgerError> {
        let merkle_root = digest_to_hex(&merkle::build(&votes)?);
        Ok(Self {
            index,
            previous_hash,
            merkle_root,
            timestamp: now_millis(),
            election_id,
            nonce: 0,
            votes,
        })
    }

    fn content(&self) -> BlockContent<'_> {
        BlockContent {
            index: self.index,
            previous_hash: &self.previous_hash,
            merkle_root: &self.merkle_root,
            timestamp: self.timestamp,
            election_id: &self.election_id,
            votes: &self.votes,
        }
    }

    /// Searches for a nonce whose block hash has `difficulty` leading zero hex
    /// characters.  Runs to completion; expected work grows as `16^difficulty`.
    pub fn mine(self, difficulty: usize) -> Result<Block, LedgerError> {
        let template = self.content().template()?;
        let started = Instant::now();
        let mut buf = Vec::with_capacity(256);
        let mut nonce = self.nonce;
        let digest: Digest = loop {
            let digest = template.hash(nonce, &mut buf);
            if leading_zero_hex(&digest) >= difficulty {
                break digest;
            }
            nonce = nonce.wrapping_add(1);
        };
        debug!(
            "QSYS|mod=MINER|evt=SOLVED|election={}|index={}|difficulty={}|nonce={}|attempts={}|ms={}",
            self.election_id,
            self.index,
            difficulty,
            nonce,
            nonce.wrapping_sub(self.nonce).wrapping_add(1),
            started.elapsed().as_millis()
        );
        Ok(Block {
            index: self.index,
            previous_hash: self.previous_hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            election_id: self.election_id,
            nonce,
            hash: digest_to_hex(&digest),
            votes: self.votes,
        })
    }
}

impl Block {
    /// Mines the genesis block for `election_id`.
    pub fn genesis(election_id: &str, difficulty: usize) -> Result<Self, LedgerError> {
        UnminedBlock::assemble(
            0,
            GENESIS_PREVIOUS_HASH.to_string(),
            election_id.to_string(),
            Vec::new(),
        )?
        .mine(difficulty)
    }

    fn content(&self) -> BlockContent<'_> {
        BlockContent {
            index: self.index,
            previous_hash: &self.previous_hash,
            merkle_root: &self.merkle_root,
            timestamp: self.timestamp,
            election_id: &self.election_id,
            votes: &self.votes,
        }
    }

    /// Recomputes the content hash at the stored nonce.
    pub fn compute_hash(&self) -> Result<Digest, LedgerError> {
        let template = self.content().template()?;
        Ok(template.hash(self.nonce, &mut Vec::new()))
    }

    /// Recomputes the Merkle root and hash and checks the difficulty target.
    pub fn validate(&self, difficulty: usize) -> BlockValidation {
        let mut faults = Vec::new();
        let merkle_ok = merkle::build(&self.votes)
            .map(|root| digest_to_hex(&root) == self.merkle_root)
            .unwrap_or(false);
        if !merkle_ok {
            faults.push(BlockFault::MerkleMismatch);
        }
        match self.compute_hash() {
            Ok(digest) => {
                if digest_to_hex(&digest) != self.hash {
                    faults.push(BlockFault::HashMismatch);
                }
                if leading_zero_hex(&digest) < difficulty {
                    faults.push(BlockFault::DifficultyNotMet);
                }
            }
            Err(_) => {
                faults.push(BlockFault::HashMismatch);
                faults.push(BlockFault::DifficultyNotMet);
            }
        }
        BlockValidation { faults }
    }

    /// Whether this block has the genesis shape.
    pub fn is_genesis_shaped(&self) -> bool {
        self.index == 0
            && self.previous_hash == GENESIS_PREVIOUS_HASH
            && self.votes.is_empty()
            && self.merkle_root == digest_to_hex(&merkle::empty_root())
    }

    /// Position of the vote with `vote_id` in this block.
    pub fn position_of(&self, vote_id: &str) -> Option<usize> {
        self.votes.iter().position(|tx| tx.vote_id == vote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{canonicalize_value, double_hash};
    use crate::sign::keypair_from_seed;

    fn sample_votes(n: usize) -> Vec<VoteTransaction> {
        (0..n)
            .map(|i| {
                let keys = keypair_from_seed(&format!("block-voter-{i}"));
                VoteTransaction::signed(&keys, "e-1", "cand-a", 100 + i as u64).unwrap()
            })
            .collect()
    }

    fn mined(difficulty: usize) -> Block {
        UnminedBlock::assemble(1, "ab".repeat(32), "e-1".into(), sample_votes(3))
            .unwrap()
            .mine(difficulty)
            .unwrap()
    }

    #[test]
    fn mined_block_meets_difficulty_and_validates() {
        for difficulty in 0..=3 {
            let block = mined(difficulty);
            assert!(block.hash.chars().take(difficulty).all(|c| c == '0'));
            assert!(block.validate(difficulty).is_valid());
        }
    }

    #[test]
    fn hash_covers_full_canonical_content() {
        let block = mined(1);
        let mut value = serde_json::to_value(&block).unwrap();
        value.as_object_mut().unwrap().remove("hash");
        let expected = double_hash(&canonicalize_value(&value).unwrap());
        assert_eq!(digest_to_hex(&expected), block.hash);
    }

    #[test]
    fn tampered_votes_report_merkle_and_hash_mismatch() {
        let mut block = mined(1);
        block.votes[1].candidate_id = "cand-b".into();
        let report = block.validate(1);
        assert_eq!(report.first_fault(), Some(BlockFault::MerkleMismatch));
        assert!(report.faults.contains(&BlockFault::HashMismatch));
    }

    #[test]
    fn rewritten_nonce_is_detected() {
        let mut block = mined(2);
        block.nonce = block.nonce.wrapping_add(1);
        let report = block.validate(2);
        assert!(report.faults.contains(&BlockFault::HashMismatch));
        assert!(!report.faults.contains(&BlockFault::MerkleMismatch));
    }

    #[test]
    fn difficulty_is_checked_against_target() {
        let block = mined(0);
        if !block.hash.starts_with("0000") {
            assert!(block
                .validate(4)
                .faults
                .contains(&BlockFault::DifficultyNotMet));
        }
    }

    #[test]
    fn genesis_shape() {
        let genesis = Block::genesis("e-9", 1).unwrap();
        assert!(genesis.is_genesis_shaped());
        assert!(genesis.validate(1).is_valid());
        assert_eq!(genesis.election_id, "e-9");
    }
}
