#![deny(missing_docs)]

//! # ballot_ledger
//!
//! **ballot_ledger** keeps one append-only chain of sealed vote batches per
//! election.  Votes are signed ballots; blocks commit to their votes through a
//! Merkle root and to their predecessor through its hash, and each block is
//! sealed with a small proof-of-work so silent rewriting is both detectable and
//! costly.  Any party holding a copy of a chain can re-validate it end to end.
//!
//! ## Modules
//!
//! * [`canonical`]: byte-stable JSON encoding and the double SHA-256 digest
//!   every other hash is built on.
//! * [`sign`]: ed25519 key material and base64 signature helpers.
//! * [`vote`]: ballots and the vote transactions stored in blocks.
//! * [`merkle`]: roots and inclusion proofs over a block's votes.
//! * [`block`]: block assembly, mining and self-validation.
//! * [`chain`]: append with linkage checks and full re-validation with threat
//!   classification.
//! * [`ledger`]: the per-election registry that admits votes and seals blocks.
//! * [`record`]: the persisted block record and JSON chain documents.
//! * `worker` (feature `worker`): background sealing on tokio.
//!
//! ## Usage
//!
//! ```rust
//! use ballot_ledger::{keypair_from_seed, Ballot, LedgerConfig, LedgerManager, VoteStatus};
//!
//! let manager = LedgerManager::new(LedgerConfig {
//!     difficulty: 1,
//!     max_votes_per_block: 1,
//!     ..LedgerConfig::default()
//! })
//! .unwrap();
//!
//! let keys = keypair_from_seed("voter-1");
//! let ballot = Ballot {
//!     election_id: "board-2026".into(),
//!     voter_public_key: keys.public_key_base64(),
//!     candidate_id: "alice".into(),
//!     timestamp: 1_700_000_000_000,
//! };
//! let signature = ballot.sign(&keys).unwrap();
//! let receipt = manager.submit_vote("board-2026", ballot, signature).unwrap();
//! assert!(matches!(receipt.status, VoteStatus::Sealed { block_index: 1, .. }));
//! assert!(manager.validate("board-2026").unwrap().is_valid);
//! ```

pub mod block;
pub mod canonical;
pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod record;
pub mod sign;
pub mod vote;
#[cfg(feature = "worker")]
pub mod worker;

pub use block::{Block, BlockFault, BlockValidation, UnminedBlock, GENESIS_PREVIOUS_HASH};
pub use canonical::{canonical_hash, canonicalize, double_hash, Digest};
pub use chain::{
    Chain, ChainIssue, ChainValidationResult, IssueKind, ThreatKind, ValidationOptions,
};
pub use config::{ClosePolicy, LedgerConfig, SealMode, MAX_DIFFICULTY};
pub use error::LedgerError;
pub use ledger::{
    inclusion_in_chain, Admission, ArchivedElection, LedgerManager, VoteInclusion, VoteReceipt,
    VoteStatus,
};
pub use merkle::{MerkleProof, MerkleProofNode};
pub use record::{load_chain_file, write_chain_file, BlockRecord, ChainDocument};
pub use sign::{keypair_from_seed, Ed25519KeySource, KeyError, KeyMaterial};
pub use vote::{Ballot, VoteTransaction};
#[cfg(feature = "worker")]
pub use worker::{SealEvent, SealWorker};
