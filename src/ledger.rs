//! Election registry: one chain and one pending pool per election.
//!
//! The registry lock is only held to look up or insert an election entry.
//! Each entry carries two locks: `state` guards the chain and the pending
//! pool and is only ever held briefly, while `sealing` serializes miners of the
//! same election.  Mining runs with neither the registry lock nor the state
//! lock held, so submissions, reads and validation continue meanwhile.  Votes
//! being mined are tracked as in-flight so duplicate detection stays exact.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::block::{Block, UnminedBlock};
use crate::canonical::digest_from_hex;
use crate::chain::{Chain, ChainValidationResult, ValidationOptions};
use crate::config::{ClosePolicy, LedgerConfig, SealMode};
use crate::error::LedgerError;
use crate::merkle::{self, MerkleProof};
use crate::record::BlockRecord;
use crate::sign;
use crate::vote::{Ballot, VoteTransaction};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, LedgerError> {
    mutex.lock().map_err(|_| LedgerError::LockPoisoned)
}

/// Where an admitted vote currently sits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VoteStatus {
    /// Waiting in the pending pool (or being mined).
    Pending,
    /// Sealed into a block.
    #[serde(rename_all = "camelCase")]
    Sealed {
        /// Index of the sealing block.
        block_index: u64,
        /// Hash of the sealing block.
        block_hash: String,
    },
}

/// Reference handed back to the application for an accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    /// Identifier of the accepted vote.
    pub vote_id: String,
    /// Election the vote was cast in.
    pub election_id: String,
    /// Current placement of the vote.
    #[serde(flatten)]
    pub status: VoteStatus,
}

/// Result of admitting a vote without sealing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Receipt for the admitted vote (always pending).
    pub receipt: VoteReceipt,
    /// `true` when the pool has reached the sealing threshold.
    pub seal_due: bool,
}

/// Everything a voter needs to check inclusion of their vote offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteInclusion {
    /// Election the vote was cast in.
    pub election_id: String,
    /// The vote being proven.
    pub vote_id: String,
    /// Index of the block holding the vote.
    pub block_index: u64,
    /// Hash of that block.
    pub block_hash: String,
    /// Merkle root committed in that block.
    pub merkle_root: String,
    /// Sibling path from the vote's leaf to the root.
    pub proof: MerkleProof,
}

impl VoteInclusion {
    /// Checks the proof against the block's committed Merkle root.
    pub fn verify(&self) -> bool {
        match digest_from_hex(&self.merkle_root) {
            Ok(root) => merkle::verify_proof(&self.proof.leaf, &self.proof, &root),
            Err(_) => false,
        }
    }

    /// JSON rendering with hex digests.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "electionId": self.election_id,
            "voteId": self.vote_id,
            "blockIndex": self.block_index,
            "blockHash": self.block_hash,
            "merkleRoot": self.merkle_root,
            "proof": self.proof.to_json(),
        })
    }
}

/// Final state of an archived election.
#[derive(Debug, Clone)]
pub struct ArchivedElection {
    /// The sealed chain at archive time.
    pub chain: Chain,
    /// Votes left unsealed under [`ClosePolicy::Retain`].
    pub unsealed: Vec<VoteTransaction>,
}

#[derive(Debug)]
struct ElectionState {
    chain: Chain,
    pending: VecDeque<VoteTransaction>,
    pending_voters: HashSet<String>,
    in_flight_voters: HashSet<String>,
    sealed_voters: HashSet<String>,
    // Set once archiving starts; admission is refused from then on.
    closed: bool,
}

impl ElectionState {
    fn new(chain: Chain) -> Self {
        let sealed_voters = chain
            .votes()
            .map(|(_, tx)| tx.voter_public_key.clone())
            .collect();
        Self {
            chain,
            pending: VecDeque::new(),
            pending_voters: HashSet::new(),
            in_flight_voters: HashSet::new(),
            sealed_voters,
            closed: false,
        }
    }

    fn knows_voter(&self, voter: &str) -> bool {
        self.pending_voters.contains(voter)
            || self.in_flight_voters.contains(voter)
            || self.sealed_voters.contains(voter)
    }
}

#[derive(Debug)]
struct ElectionLedger {
    election_id: String,
    state: Mutex<ElectionState>,
    sealing: Mutex<()>,
}

impl ElectionLedger {
    fn new(chain: Chain) -> Self {
        Self {
            election_id: chain.election_id().to_string(),
            state: Mutex::new(ElectionState::new(chain)),
            sealing: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Result<Chain, LedgerError> {
        Ok(lock(&self.state)?.chain.clone())
    }

    fn seal(&self, config: &LedgerConfig) -> Result<Arc<Block>, LedgerError> {
        let _sealing = lock(&self.sealing)?;

        let (batch, index, previous_hash, difficulty) = {
            let mut state = lock(&self.state)?;
            if state.pending.is_empty() && !config.allow_empty_blocks {
                return Err(LedgerError::EmptyBlockDisallowed(self.election_id.clone()));
            }
            let take = state.pending.len().min(config.max_votes_per_block);
            let batch: Vec<VoteTransaction> = state.pending.drain(..take).collect();
            for tx in &batch {
                state.pending_voters.remove(&tx.voter_public_key);
                state.in_flight_voters.insert(tx.voter_public_key.clone());
            }
            (
                batch,
                state.chain.len() as u64,
                state.chain.head_hash().to_string(),
                state.chain.difficulty(),
            )
        };

        let mined = UnminedBlock::assemble(
            index,
            previous_hash,
            self.election_id.clone(),
            batch.clone(),
        )
        .and_then(|unmined| unmined.mine(difficulty));

        let mut state = lock(&self.state)?;
        match mined.and_then(|block| state.chain.append(block)) {
            Ok(block) => {
                for tx in &batch {
                    state.in_flight_voters.remove(&tx.voter_public_key);
                    state.sealed_voters.insert(tx.voter_public_key.clone());
                }
                info!(
                    "QSYS|mod=LEDGER|evt=SEAL|election={}|index={}|votes={}|nonce={}|hash={}|pending={}",
                    self.election_id,
                    block.index,
                    block.votes.len(),
                    block.nonce,
                    block.hash,
                    state.pending.len()
                );
                Ok(block)
            }
            Err(err) => {
                for tx in batch.into_iter().rev() {
                    state.in_flight_voters.remove(&tx.voter_public_key);
                    state.pending_voters.insert(tx.voter_public_key.clone());
                    state.pending.push_front(tx);
                }
                warn!(
                    "QSYS|mod=LEDGER|evt=SEAL_FAILED|election={}|error={}",
                    self.election_id, err
                );
                Err(err)
            }
        }
    }
}

/// Owns one `(Chain, pending pool)` pair per election.
///
/// Construct one per process at the composition root and share it by `Arc`.
#[derive(Debug)]
pub struct LedgerManager {
    config: LedgerConfig,
    elections: RwLock<HashMap<String, Arc<ElectionLedger>>>,
    archived: RwLock<HashSet<String>>,
}

impl LedgerManager {
    /// Creates an empty registry after validating `config`.
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            config,
            elections: RwLock::new(HashMap::new()),
            archived: RwLock::new(HashSet::new()),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Identifiers of every live election.
    pub fn election_ids(&self) -> Result<Vec<String>, LedgerError> {
        let elections = self
            .elections
            .read()
            .map_err(|_| LedgerError::LockPoisoned)?;
        let mut ids: Vec<String> = elections.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn is_archived(&self, election_id: &str) -> Result<bool, LedgerError> {
        Ok(self
            .archived
            .read()
            .map_err(|_| LedgerError::LockPoisoned)?
            .contains(election_id))
    }

    fn lookup(&self, election_id: &str) -> Result<Option<Arc<ElectionLedger>>, LedgerError> {
        let elections = self
            .elections
            .read()
            .map_err(|_| LedgerError::LockPoisoned)?;
        Ok(elections.get(election_id).cloned())
    }

    fn entry(&self, election_id: &str) -> Result<Arc<ElectionLedger>, LedgerError> {
        if let Some(entry) = self.lookup(election_id)? {
            return Ok(entry);
        }
        if self.is_archived(election_id)? {
            return Err(LedgerError::ElectionArchived(election_id.to_string()));
        }
        Err(LedgerError::UnknownElection(election_id.to_string()))
    }

    fn entry_or_create(&self, election_id: &str) -> Result<Arc<ElectionLedger>, LedgerError> {
        if let Some(entry) = self.lookup(election_id)? {
            return Ok(entry);
        }
        if self.is_archived(election_id)? {
            return Err(LedgerError::ElectionArchived(election_id.to_string()));
        }
        // Genesis is mined before taking the registry write lock.
        let fresh = Arc::new(ElectionLedger::new(Chain::new(
            election_id,
            self.config.difficulty,
        )?));
        let mut elections = self
            .elections
            .write()
            .map_err(|_| LedgerError::LockPoisoned)?;
        if self.is_archived(election_id)? {
            return Err(LedgerError::ElectionArchived(election_id.to_string()));
        }
        let entry = elections
            .entry(election_id.to_string())
            .or_insert_with(|| {
                info!("QSYS|mod=LEDGER|evt=OPEN|election={election_id}");
                fresh
            });
        Ok(Arc::clone(entry))
    }

    /// Creates the election's chain if it does not exist yet.
    pub fn open_election(&self, election_id: &str) -> Result<(), LedgerError> {
        self.entry_or_create(election_id).map(|_| ())
    }

    /// Verifies and enqueues a vote without sealing.
    pub fn admit_vote(
        &self,
        election_id: &str,
        ballot: Ballot,
        signature: String,
    ) -> Result<Admission, LedgerError> {
        if ballot.election_id != election_id {
            return Err(LedgerError::ElectionMismatch {
                requested: election_id.to_string(),
                ballot: ballot.election_id,
            });
        }
        if !sign::verify(
            &ballot.voter_public_key,
            &ballot.signing_bytes()?,
            &signature,
        ) {
            warn!("QSYS|mod=LEDGER|evt=REJECT|election={election_id}|reason=invalid_signature");
            return Err(LedgerError::InvalidSignature);
        }
        let entry = self.entry_or_create(election_id)?;
        let tx = VoteTransaction::from_ballot(ballot, signature)?;

        let mut state = lock(&entry.state)?;
        if state.closed {
            return Err(LedgerError::ElectionArchived(election_id.to_string()));
        }
        if state.knows_voter(&tx.voter_public_key) {
            warn!("QSYS|mod=LEDGER|evt=REJECT|election={election_id}|reason=duplicate_vote");
            return Err(LedgerError::DuplicateVote {
                election_id: election_id.to_string(),
                voter: tx.voter_public_key,
            });
        }
        state.pending_voters.insert(tx.voter_public_key.clone());
        let receipt = VoteReceipt {
            vote_id: tx.vote_id.clone(),
            election_id: election_id.to_string(),
            status: VoteStatus::Pending,
        };
        state.pending.push_back(tx);
        let seal_due = state.pending.len() >= self.config.max_votes_per_block;
        debug!(
            "QSYS|mod=LEDGER|evt=ADMIT|election={}|vote={}|pending={}",
            election_id,
            receipt.vote_id,
            state.pending.len()
        );
        Ok(Admission { receipt, seal_due })
    }

    /// Admits a vote and, in inline seal mode, seals once the pool is full.
    pub fn submit_vote(
        &self,
        election_id: &str,
        ballot: Ballot,
        signature: String,
    ) -> Result<VoteReceipt, LedgerError> {
        let Admission {
            mut receipt,
            seal_due,
        } = self.admit_vote(election_id, ballot, signature)?;
        if seal_due && self.config.seal_mode == SealMode::Inline {
            match self.seal_block(election_id) {
                Ok(block) => {
                    if block.position_of(&receipt.vote_id).is_some() {
                        receipt.status = VoteStatus::Sealed {
                            block_index: block.index,
                            block_hash: block.hash.clone(),
                        };
                    }
                }
                // The vote stays pending; the next seal or close will pick it up.
                Err(err) => warn!(
                    "QSYS|mod=LEDGER|evt=INLINE_SEAL_FAILED|election={election_id}|error={err}"
                ),
            }
        }
        Ok(receipt)
    }

    /// Seals up to `max_votes_per_block` pending votes into a mined block.
    pub fn seal_block(&self, election_id: &str) -> Result<Arc<Block>, LedgerError> {
        self.entry(election_id)?.seal(&self.config)
    }

    /// Handles the "election ended" signal according to the close policy.
    pub fn close_election(&self, election_id: &str) -> Result<Vec<Arc<Block>>, LedgerError> {
        let entry = self.entry(election_id)?;
        let mut sealed = Vec::new();
        match self.config.close_policy {
            ClosePolicy::Retain => {
                let pending = lock(&entry.state)?.pending.len();
                info!(
                    "QSYS|mod=LEDGER|evt=CLOSE|election={election_id}|policy=retain|pending={pending}"
                );
            }
            ClosePolicy::Flush => {
                while !lock(&entry.state)?.pending.is_empty() {
                    match entry.seal(&self.config) {
                        Ok(block) => sealed.push(block),
                        Err(LedgerError::EmptyBlockDisallowed(_)) => break,
                        Err(err) => return Err(err),
                    }
                }
                info!(
                    "QSYS|mod=LEDGER|evt=CLOSE|election={}|policy=flush|blocks={}",
                    election_id,
                    sealed.len()
                );
            }
        }
        Ok(sealed)
    }

    /// Closes the election and removes it from the registry.
    ///
    /// Admission stops before the close policy runs, so every vote accepted
    /// earlier ends up either in the returned chain or in `unsealed`.
    pub fn archive_election(&self, election_id: &str) -> Result<ArchivedElection, LedgerError> {
        let entry = self.entry(election_id)?;
        lock(&entry.state)?.closed = true;
        if let Err(err) = self.close_election(election_id) {
            if let Ok(mut state) = lock(&entry.state) {
                state.closed = false;
            }
            return Err(err);
        }
        let entry = {
            let mut elections = self
                .elections
                .write()
                .map_err(|_| LedgerError::LockPoisoned)?;
            let entry = elections
                .remove(election_id)
                .ok_or_else(|| LedgerError::UnknownElection(election_id.to_string()))?;
            self.archived
                .write()
                .map_err(|_| LedgerError::LockPoisoned)?
                .insert(election_id.to_string());
            entry
        };
        // Wait out a miner that may still hold this entry.
        let _sealing = lock(&entry.sealing)?;
        let state = lock(&entry.state)?;
        let archived = ArchivedElection {
            chain: state.chain.clone(),
            unsealed: state.pending.iter().cloned().collect(),
        };
        info!(
            "QSYS|mod=LEDGER|evt=ARCHIVE|election={}|blocks={}|unsealed={}",
            election_id,
            archived.chain.len(),
            archived.unsealed.len()
        );
        Ok(archived)
    }

    /// Rebuilds an election from persisted block records.
    ///
    /// The chain is fully validated first; any issue rejects the restore.
    pub fn restore_election(
        &self,
        election_id: &str,
        records: Vec<BlockRecord>,
    ) -> Result<ChainValidationResult, LedgerError> {
        if self.is_archived(election_id)? {
            return Err(LedgerError::ElectionArchived(election_id.to_string()));
        }
        let blocks = records
            .into_iter()
            .map(BlockRecord::into_block)
            .collect::<Result<Vec<_>, _>>()?;
        let chain = Chain::from_blocks(election_id, self.config.difficulty, blocks);
        let report = chain.validate_full(self.validation_options());
        if !report.is_valid {
            let first = report
                .errors
                .first()
                .map(|issue| format!("block {}: {}", issue.block_index, issue.detail))
                .unwrap_or_default();
            return Err(LedgerError::InvalidChain {
                election_id: election_id.to_string(),
                errors: report.errors.len(),
                first,
            });
        }
        let mut elections = self
            .elections
            .write()
            .map_err(|_| LedgerError::LockPoisoned)?;
        if elections.contains_key(election_id) {
            return Err(LedgerError::ElectionExists(election_id.to_string()));
        }
        elections.insert(
            election_id.to_string(),
            Arc::new(ElectionLedger::new(chain)),
        );
        info!(
            "QSYS|mod=LEDGER|evt=RESTORE|election={}|blocks={}",
            election_id, report.total_blocks
        );
        Ok(report)
    }

    /// Immutable snapshot of the election's chain.
    pub fn chain(&self, election_id: &str) -> Result<Chain, LedgerError> {
        self.entry(election_id)?.snapshot()
    }

    /// Persistable records for every block in the election's chain.
    pub fn export_records(&self, election_id: &str) -> Result<Vec<BlockRecord>, LedgerError> {
        self.chain(election_id)?
            .blocks()
            .iter()
            .map(|block| BlockRecord::from_block(block))
            .collect()
    }

    fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            verify_signatures: true,
            verify_inclusion: self.config.verify_inclusion,
        }
    }

    /// Full re-validation of a snapshot of the election's chain.
    pub fn validate(&self, election_id: &str) -> Result<ChainValidationResult, LedgerError> {
        let snapshot = self.chain(election_id)?;
        Ok(snapshot.validate_full(self.validation_options()))
    }

    /// Number of votes waiting to be sealed (excluding in-flight ones).
    pub fn pending_count(&self, election_id: &str) -> Result<usize, LedgerError> {
        Ok(lock(&self.entry(election_id)?.state)?.pending.len())
    }

    /// Inclusion proof for a sealed vote, `None` if it is not sealed.
    pub fn inclusion_proof(
        &self,
        election_id: &str,
        vote_id: &str,
    ) -> Result<Option<VoteInclusion>, LedgerError> {
        let snapshot = self.chain(election_id)?;
        inclusion_in_chain(&snapshot, vote_id)
    }

    /// Per-candidate counts over sealed votes.
    pub fn tally(&self, election_id: &str) -> Result<BTreeMap<String, u64>, LedgerError> {
        Ok(self.chain(election_id)?.tally())
    }
}

/// Builds an inclusion proof for `vote_id` from a chain snapshot.
pub fn inclusion_in_chain(
    chain: &Chain,
    vote_id: &str,
) -> Result<Option<VoteInclusion>, LedgerError> {
    let Some((block, position)) = chain.find_vote(vote_id) else {
        return Ok(None);
    };
    let Some(proof) = merkle::proof(&block.votes, position)? else {
        return Ok(None);
    };
    Ok(Some(VoteInclusion {
        election_id: chain.election_id().to_string(),
        vote_id: vote_id.to_string(),
        block_index: block.index,
        block_hash: block.hash.clone(),
        merkle_root: block.merkle_root.clone(),
        proof,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::IssueKind;
    use crate::sign::{keypair_from_seed, KeyMaterial};
    use std::sync::Barrier;
    use std::thread;
    use std::time::{Duration, Instant};

    fn config(max_votes_per_block: usize) -> LedgerConfig {
        LedgerConfig {
            difficulty: 1,
            max_votes_per_block,
            ..LedgerConfig::default()
        }
    }

    fn ballot(keys: &KeyMaterial, election: &str, candidate: &str) -> (Ballot, String) {
        let ballot = Ballot {
            election_id: election.to_string(),
            voter_public_key: keys.public_key_base64(),
            candidate_id: candidate.to_string(),
            timestamp: 1_700_000_000_000,
        };
        let signature = ballot.sign(keys).unwrap();
        (ballot, signature)
    }

    fn cast(manager: &LedgerManager, election: &str, seed: &str, candidate: &str) -> VoteReceipt {
        let keys = keypair_from_seed(seed);
        let (ballot, signature) = ballot(&keys, election, candidate);
        manager.submit_vote(election, ballot, signature).unwrap()
    }

    #[test]
    fn fifth_vote_seals_a_block() {
        let manager = LedgerManager::new(config(5)).unwrap();
        let receipts: Vec<VoteReceipt> = (0..5)
            .map(|i| cast(&manager, "e-1", &format!("v{i}"), "alice"))
            .collect();
        assert!(receipts[..4]
            .iter()
            .all(|r| r.status == VoteStatus::Pending));
        assert!(matches!(
            receipts[4].status,
            VoteStatus::Sealed { block_index: 1, .. }
        ));

        let chain = manager.chain("e-1").unwrap();
        assert_eq!(chain.len(), 2);
        let sealed: Vec<&str> = chain.blocks()[1]
            .votes
            .iter()
            .map(|tx| tx.vote_id.as_str())
            .collect();
        let submitted: Vec<&str> = receipts.iter().map(|r| r.vote_id.as_str()).collect();
        assert_eq!(sealed, submitted);

        let report = manager.validate("e-1").unwrap();
        assert!(report.is_valid);
        assert_eq!(report.valid_blocks, 2);
        assert_eq!(manager.pending_count("e-1").unwrap(), 0);
    }

    #[test]
    fn duplicate_rejected_while_pending_and_after_sealing() {
        let manager = LedgerManager::new(config(2)).unwrap();
        let keys = keypair_from_seed("dup");
        let (first, sig) = ballot(&keys, "e-1", "alice");
        manager.submit_vote("e-1", first, sig).unwrap();

        let (again, sig) = ballot(&keys, "e-1", "bob");
        assert!(matches!(
            manager.submit_vote("e-1", again.clone(), sig.clone()),
            Err(LedgerError::DuplicateVote { .. })
        ));

        cast(&manager, "e-1", "other", "bob");
        assert_eq!(manager.chain("e-1").unwrap().len(), 2);
        assert!(matches!(
            manager.submit_vote("e-1", again, sig),
            Err(LedgerError::DuplicateVote { .. })
        ));
    }

    #[test]
    fn same_voter_may_vote_in_other_elections() {
        let manager = LedgerManager::new(config(10)).unwrap();
        cast(&manager, "e-1", "shared", "a");
        cast(&manager, "e-2", "shared", "a");
        assert_eq!(manager.election_ids().unwrap(), vec!["e-1", "e-2"]);
    }

    #[test]
    fn bad_signature_never_touches_state() {
        let manager = LedgerManager::new(config(10)).unwrap();
        let keys = keypair_from_seed("honest");
        let (ballot, _) = ballot(&keys, "e-1", "a");
        let forged = keypair_from_seed("forger")
            .sign_base64(&ballot.signing_bytes().unwrap());
        assert!(matches!(
            manager.submit_vote("e-1", ballot.clone(), forged),
            Err(LedgerError::InvalidSignature)
        ));
        assert!(matches!(
            manager.chain("e-1"),
            Err(LedgerError::UnknownElection(_))
        ));
        assert!(matches!(
            manager.submit_vote("e-2", ballot, "AAAA".into()),
            Err(LedgerError::ElectionMismatch { .. })
        ));
    }

    #[test]
    fn empty_seal_follows_policy() {
        let manager = LedgerManager::new(config(10)).unwrap();
        manager.open_election("e-1").unwrap();
        assert!(matches!(
            manager.seal_block("e-1"),
            Err(LedgerError::EmptyBlockDisallowed(_))
        ));

        let permissive = LedgerManager::new(LedgerConfig {
            allow_empty_blocks: true,
            ..config(10)
        })
        .unwrap();
        permissive.open_election("e-1").unwrap();
        let block = permissive.seal_block("e-1").unwrap();
        assert!(block.votes.is_empty());
        assert!(permissive.validate("e-1").unwrap().is_valid);
    }

    #[test]
    fn close_flushes_partial_blocks() {
        let manager = LedgerManager::new(config(2)).unwrap();
        for i in 0..5 {
            cast(&manager, "e-1", &format!("c{i}"), "x");
        }
        assert_eq!(manager.pending_count("e-1").unwrap(), 1);
        let sealed = manager.close_election("e-1").unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(manager.chain("e-1").unwrap().len(), 4);
        assert!(manager.validate("e-1").unwrap().is_valid);
    }

    #[test]
    fn retain_policy_keeps_pending_votes() {
        let manager = LedgerManager::new(LedgerConfig {
            close_policy: ClosePolicy::Retain,
            ..config(10)
        })
        .unwrap();
        cast(&manager, "e-1", "r", "x");
        assert!(manager.close_election("e-1").unwrap().is_empty());
        let archived = manager.archive_election("e-1").unwrap();
        assert_eq!(archived.unsealed.len(), 1);
        assert_eq!(archived.chain.len(), 1);
    }

    #[test]
    fn archived_election_rejects_new_votes() {
        let manager = LedgerManager::new(config(10)).unwrap();
        cast(&manager, "e-1", "a", "x");
        let archived = manager.archive_election("e-1").unwrap();
        assert_eq!(archived.chain.len(), 2);
        assert!(archived.unsealed.is_empty());

        let keys = keypair_from_seed("late");
        let (late, sig) = ballot(&keys, "e-1", "x");
        assert!(matches!(
            manager.submit_vote("e-1", late, sig),
            Err(LedgerError::ElectionArchived(_))
        ));
    }

    #[test]
    fn deferred_mode_leaves_sealing_to_caller() {
        let manager = LedgerManager::new(LedgerConfig {
            seal_mode: SealMode::Deferred,
            ..config(1)
        })
        .unwrap();
        let receipt = cast(&manager, "e-1", "d", "x");
        assert_eq!(receipt.status, VoteStatus::Pending);
        assert_eq!(manager.pending_count("e-1").unwrap(), 1);
        manager.seal_block("e-1").unwrap();
        assert_eq!(manager.pending_count("e-1").unwrap(), 0);
    }

    #[test]
    fn inclusion_proof_and_tally() {
        let manager = LedgerManager::new(config(3)).unwrap();
        let receipts: Vec<VoteReceipt> = ["a", "b", "a"]
            .iter()
            .enumerate()
            .map(|(i, c)| cast(&manager, "e-1", &format!("p{i}"), c))
            .collect();
        let inclusion = manager
            .inclusion_proof("e-1", &receipts[1].vote_id)
            .unwrap()
            .unwrap();
        assert_eq!(inclusion.block_index, 1);
        assert!(inclusion.verify());
        assert!(manager.inclusion_proof("e-1", "missing").unwrap().is_none());

        let tally = manager.tally("e-1").unwrap();
        assert_eq!(tally.get("a"), Some(&2));
        assert_eq!(tally.get("b"), Some(&1));
    }

    #[test]
    fn restore_round_trips_and_rejects_tampering() {
        let source = LedgerManager::new(config(2)).unwrap();
        for i in 0..4 {
            cast(&source, "e-1", &format!("s{i}"), "x");
        }
        let records = source.export_records("e-1").unwrap();

        let target = LedgerManager::new(config(2)).unwrap();
        let report = target.restore_election("e-1", records.clone()).unwrap();
        assert_eq!(report.valid_blocks, 3);
        let keys = keypair_from_seed("s0");
        let (replay, sig) = ballot(&keys, "e-1", "x");
        assert!(matches!(
            target.submit_vote("e-1", replay, sig),
            Err(LedgerError::DuplicateVote { .. })
        ));
        assert!(matches!(
            target.restore_election("e-1", records.clone()),
            Err(LedgerError::ElectionExists(_))
        ));

        let mut forged = records;
        forged[1].nonce += 1;
        let other = LedgerManager::new(config(2)).unwrap();
        assert!(matches!(
            other.restore_election("e-1", forged),
            Err(LedgerError::InvalidChain { .. })
        ));
    }

    #[test]
    fn validation_sees_tampering_in_snapshot() {
        let manager = LedgerManager::new(config(2)).unwrap();
        cast(&manager, "e-1", "t0", "x");
        cast(&manager, "e-1", "t1", "y");
        let snapshot = manager.chain("e-1").unwrap();
        let mut blocks: Vec<Block> = snapshot.blocks().iter().map(|b| (**b).clone()).collect();
        blocks[1].votes.swap(0, 1);
        let tampered = Chain::from_blocks("e-1", 1, blocks);
        let report = tampered.validate_full(ValidationOptions::default());
        assert!(report.has_issue(1, IssueKind::MerkleMismatch));
        assert!(manager.validate("e-1").unwrap().is_valid);
    }

    #[test]
    fn archive_never_drops_accepted_votes() {
        for round in 0..25 {
            let manager = Arc::new(LedgerManager::new(config(4)).unwrap());
            let election = format!("race-{round}");
            manager.open_election(&election).unwrap();
            let start = Arc::new(Barrier::new(5));
            let submitters: Vec<_> = (0..4)
                .map(|t| {
                    let manager = Arc::clone(&manager);
                    let start = Arc::clone(&start);
                    let election = election.clone();
                    thread::spawn(move || {
                        let ballots: Vec<(Ballot, String)> = (0..4)
                            .map(|i| {
                                let keys = keypair_from_seed(&format!("{election}/{t}/{i}"));
                                ballot(&keys, &election, "x")
                            })
                            .collect();
                        start.wait();
                        ballots
                            .into_iter()
                            .filter_map(|(b, sig)| manager.submit_vote(&election, b, sig).ok())
                            .map(|receipt| receipt.vote_id)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            start.wait();
            let archived = manager.archive_election(&election).unwrap();

            let kept: HashSet<String> = archived
                .chain
                .votes()
                .map(|(_, tx)| tx.vote_id.clone())
                .chain(archived.unsealed.iter().map(|tx| tx.vote_id.clone()))
                .collect();
            for handle in submitters {
                for vote_id in handle.join().unwrap() {
                    assert!(
                        kept.contains(&vote_id),
                        "round {round}: accepted vote {vote_id} missing from archive"
                    );
                }
            }
        }
    }

    #[test]
    fn closed_entry_refuses_admission() {
        let manager = LedgerManager::new(config(10)).unwrap();
        manager.open_election("e-1").unwrap();
        let entry = manager.entry("e-1").unwrap();
        lock(&entry.state).unwrap().closed = true;
        let keys = keypair_from_seed("late");
        let (late, sig) = ballot(&keys, "e-1", "x");
        assert!(matches!(
            manager.submit_vote("e-1", late, sig),
            Err(LedgerError::ElectionArchived(_))
        ));
        assert_eq!(manager.pending_count("e-1").unwrap(), 0);
    }

    // Genesis at difficulty 0, but every sealed block needs six leading zero
    // hex characters, so a seal stays in progress long enough to observe.
    fn slow_election(manager: &LedgerManager, election_id: &str) {
        let genesis = Block::genesis(election_id, 0).unwrap();
        let chain = Chain::from_blocks(election_id, 6, vec![genesis]);
        manager
            .elections
            .write()
            .unwrap()
            .insert(election_id.to_string(), Arc::new(ElectionLedger::new(chain)));
    }

    fn wait_until_in_flight(manager: &LedgerManager, election_id: &str, voter: &str) {
        let entry = manager.entry(election_id).unwrap();
        let deadline = Instant::now() + Duration::from_secs(30);
        while !lock(&entry.state).unwrap().in_flight_voters.contains(voter) {
            assert!(Instant::now() < deadline, "seal never picked up the vote");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn in_flight_voter_is_rejected_while_reads_proceed() {
        let manager = Arc::new(
            LedgerManager::new(LedgerConfig {
                seal_mode: SealMode::Deferred,
                ..config(10)
            })
            .unwrap(),
        );
        slow_election(&manager, "slow");
        cast(&manager, "other", "o1", "x");

        let keys = keypair_from_seed("mined");
        let (first, sig) = ballot(&keys, "slow", "alice");
        manager.submit_vote("slow", first, sig).unwrap();
        let sealer = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.seal_block("slow"))
        };
        wait_until_in_flight(&manager, "slow", &keys.public_key_base64());

        // Neither pending nor sealed: only in-flight tracking can catch it.
        assert_eq!(manager.pending_count("slow").unwrap(), 0);
        let (again, sig) = ballot(&keys, "slow", "bob");
        assert!(matches!(
            manager.submit_vote("slow", again, sig),
            Err(LedgerError::DuplicateVote { .. })
        ));

        assert_eq!(manager.chain("slow").unwrap().len(), 1);
        assert_eq!(manager.seal_block("other").unwrap().index, 1);
        assert!(manager.validate("other").unwrap().is_valid);
        assert!(!sealer.is_finished());
    }
}
