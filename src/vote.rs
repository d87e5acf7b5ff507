//! Vote transactions and the signed ballot content they carry.

use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_hash, canonicalize, digest_to_hex, Digest};
use crate::error::LedgerError;
use crate::sign::{self, KeyMaterial};

/// The signed content of a vote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ballot {
    /// Election the vote is cast in.
    pub election_id: String,
    /// Base64 ed25519 verifying key of the voter.
    pub voter_public_key: String,
    /// Chosen candidate.
    pub candidate_id: String,
    /// Cast time in Unix milliseconds.
    pub timestamp: u64,
}

impl Ballot {
    /// Canonical bytes covered by the voter signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        canonicalize(self).map_err(LedgerError::Codec)
    }

    /// Vote identifier: hex double hash of the canonical ballot.
    pub fn vote_id(&self) -> Result<String, LedgerError> {
        canonical_hash(self)
            .map(|digest| digest_to_hex(&digest))
            .map_err(LedgerError::Codec)
    }

    /// Signs the ballot with `keys` and returns the base64 signature.
    pub fn sign(&self, keys: &KeyMaterial) -> Result<String, LedgerError> {
        Ok(keys.sign_base64(&self.signing_bytes()?))
    }
}

/// An accepted vote, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTransaction {
    /// Identifier derived from the ballot content.
    pub vote_id: String,
    /// Election the vote belongs to.
    pub election_id: String,
    /// Base64 ed25519 verifying key of the voter.
    pub voter_public_key: String,
    /// Chosen candidate.
    pub candidate_id: String,
    /// Cast time in Unix milliseconds.
    pub timestamp: u64,
    /// Base64 ed25519 signature over the canonical ballot.
    pub signature: String,
}

impl VoteTransaction {
    /// Builds a transaction from a ballot and its signature without checking it.
    pub fn from_ballot(ballot: Ballot, signature: String) -> Result<Self, LedgerError> {
        let vote_id = ballot.vote_id()?;
        Ok(Self {
            vote_id,
            election_id: ballot.election_id,
            voter_public_key: ballot.voter_public_key,
            candidate_id: ballot.candidate_id,
            timestamp: ballot.timestamp,
            signature,
        })
    }

    /// Signs a fresh ballot for `keys` and wraps it in a transaction.
    pub fn signed(
        keys: &KeyMaterial,
        election_id: &str,
        candidate_id: &str,
        timestamp: u64,
    ) -> Result<Self, LedgerError> {
        let ballot = Ballot {
            election_id: election_id.to_string(),
            voter_public_key: keys.public_key_base64(),
            candidate_id: candidate_id.to_string(),
            timestamp,
        };
        let signature = ballot.sign(keys)?;
        Self::from_ballot(ballot, signature)
    }

    /// The ballot content this transaction claims to carry.
    pub fn ballot(&self) -> Ballot {
        Ballot {
            election_id: self.election_id.clone(),
            voter_public_key: self.voter_public_key.clone(),
            candidate_id: self.candidate_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Whether the signature verifies over the ballot content.
    pub fn verify_signature(&self) -> bool {
        match self.ballot().signing_bytes() {
            Ok(bytes) => sign::verify(&self.voter_public_key, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    /// Whether `vote_id` matches the ballot content.
    pub fn vote_id_matches(&self) -> bool {
        self.ballot()
            .vote_id()
            .map(|id| id == self.vote_id)
            .unwrap_or(false)
    }

    /// Merkle leaf: double hash of the canonical transaction.
    pub fn leaf_hash(&self) -> Result<Digest, LedgerError> {
        canonical_hash(self).map_err(LedgerError::Codec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::keypair_from_seed;

    #[test]
    fn signed_transaction_verifies() {
        let keys = keypair_from_seed("voter-a");
        let tx = VoteTransaction::signed(&keys, "e-1", "cand-1", 1_700_000_000_000).unwrap();
        assert!(tx.verify_signature());
        assert!(tx.vote_id_matches());
        assert_eq!(tx.vote_id.len(), 64);
    }

    #[test]
    fn altered_candidate_breaks_signature() {
        let keys = keypair_from_seed("voter-a");
        let mut tx = VoteTransaction::signed(&keys, "e-1", "cand-1", 5).unwrap();
        tx.candidate_id = "cand-2".into();
        assert!(!tx.verify_signature());
        assert!(!tx.vote_id_matches());
    }

    #[test]
    fn signature_from_other_voter_is_rejected() {
        let alice = keypair_from_seed("alice");
        let bob = keypair_from_seed("bob");
        let ballot = Ballot {
            election_id: "e-1".into(),
            voter_public_key: alice.public_key_base64(),
            candidate_id: "c".into(),
            timestamp: 9,
        };
        let forged = ballot.sign(&bob).unwrap();
        let tx = VoteTransaction::from_ballot(ballot, forged).unwrap();
        assert!(!tx.verify_signature());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let keys = keypair_from_seed("voter-a");
        let tx = VoteTransaction::signed(&keys, "e-1", "c", 1).unwrap();
        let value = serde_json::to_value(&tx).unwrap();
        for key in [
            "voteId",
            "electionId",
            "voterPublicKey",
            "candidateId",
            "timestamp",
            "signature",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
