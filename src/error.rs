//! Crate-wide error type.

use thiserror::Error;

use crate::block::BlockFault;

/// Errors returned by ledger operations.
///
/// Submission-time rejections (`InvalidSignature`, `DuplicateVote`,
/// `ElectionMismatch`) leave the ledger untouched; the caller rejects the vote
/// and informs the voter.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ballot signature verification failed")]
    /// The ballot signature did not verify under the claimed voter key.
    InvalidSignature,
    #[error("voter {voter} already cast a vote in election {election_id}")]
    /// The voter key already has a pending, in-flight or sealed vote.
    DuplicateVote {
        /// Election the duplicate was submitted to.
        election_id: String,
        /// Base64 voter public key.
        voter: String,
    },
    #[error("block {index} does not link to the chain head (expected previous hash {expected}, found {found})")]
    /// Appended block does not reference the current head.
    BrokenLinkage {
        /// Index of the rejected block.
        index: u64,
        /// Hash of the current chain head.
        expected: String,
        /// Previous hash carried by the block.
        found: String,
    },
    #[error("block {index} hash does not match its content")]
    /// Stored hash differs from the recomputed block hash.
    HashMismatch {
        /// Index of the offending block.
        index: u64,
    },
    #[error("block {index} merkle root does not match its votes")]
    /// Stored Merkle root differs from the root over the stored votes.
    MerkleMismatch {
        /// Index of the offending block.
        index: u64,
    },
    #[error("block {index} hash does not meet difficulty {difficulty}")]
    /// Block hash has too few leading zero hex characters.
    DifficultyNotMet {
        /// Index of the offending block.
        index: u64,
        /// Required number of leading zero hex characters.
        difficulty: usize,
    },
    #[error("refusing to seal an empty block for election {0}")]
    /// Sealing was requested with an empty pending pool.
    EmptyBlockDisallowed(String),
    #[error("unknown election {0}")]
    /// No ledger exists for the election.
    UnknownElection(String),
    #[error("election {0} has been archived")]
    /// The election was archived and accepts no further operations.
    ElectionArchived(String),
    #[error("election {0} already exists")]
    /// A restore targeted an election that is already live.
    ElectionExists(String),
    #[error("chain for election {election_id} failed validation with {errors} issue(s), first: {first}")]
    /// A persisted chain did not pass full validation.
    InvalidChain {
        /// Election being restored.
        election_id: String,
        /// Number of issues found.
        errors: usize,
        /// Description of the first issue.
        first: String,
    },
    #[error("ballot targets election {ballot} but was submitted to {requested}")]
    /// Ballot election id differs from the election it was submitted to.
    ElectionMismatch {
        /// Election the submission was addressed to.
        requested: String,
        /// Election named inside the signed ballot.
        ballot: String,
    },
    #[error("codec error: {0}")]
    /// Serialization or decoding failure.
    Codec(String),
    #[error("io error: {0}")]
    /// Underlying filesystem failure.
    Io(String),
    #[error("invalid configuration: {0}")]
    /// Configuration value out of range or unparsable.
    Config(String),
    #[error("ledger state lock poisoned")]
    /// A thread panicked while holding an election lock.
    LockPoisoned,
}

impl LedgerError {
    /// Lifts a block fault into the matching error variant.
    pub fn from_fault(index: u64, fault: BlockFault, difficulty: usize) -> Self {
        match fault {
            BlockFault::MerkleMismatch => Self::MerkleMismatch { index },
            BlockFault::HashMismatch => Self::HashMismatch { index },
            BlockFault::DifficultyNotMet => Self::DifficultyNotMet { index, difficulty },
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
