//! Persisted block representation and chain documents.
//!
//! The ledger fixes the shape and hashing rule of the durable record; the
//! storage engine is the caller's choice.  [`write_chain_file`] and
//! [`load_chain_file`] provide a plain JSON document for audit export and for
//! the command-line tool.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::block::Block;
use crate::canonical::canonicalize;
use crate::chain::Chain;
use crate::error::LedgerError;
use crate::vote::VoteTransaction;

const CHAIN_SCHEMA: &str = "ballot_ledger.chain.v1";

/// One block as written to storage, with the vote list as a canonical JSON blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// Position in the election's chain.
    pub index: u64,
    /// Hash of the preceding block.
    pub previous_hash: String,
    /// Hex Merkle root over the votes.
    pub merkle_root: String,
    /// Assembly time in Unix milliseconds.
    pub timestamp: u64,
    /// Election the block belongs to.
    pub election_id: String,
    /// Mining nonce.
    pub nonce: u64,
    /// Hex block hash.
    pub hash: String,
    /// Canonical JSON encoding of the vote list.
    pub votes: String,
}

impl BlockRecord {
    /// Captures a block for storage.
    pub fn from_block(block: &Block) -> Result<Self, LedgerError> {
        let votes = canonicalize(&block.votes).map_err(LedgerError::Codec)?;
        let votes = String::from_utf8(votes).map_err(|err| LedgerError::Codec(err.to_string()))?;
        Ok(Self {
            index: block.index,
            previous_hash: block.previous_hash.clone(),
            merkle_root: block.merkle_root.clone(),
            timestamp: block.timestamp,
            election_id: block.election_id.clone(),
            nonce: block.nonce,
            hash: block.hash.clone(),
            votes,
        })
    }

    /// Decodes the record back into a block.  The result is not validated.
    pub fn into_block(self) -> Result<Block, LedgerError> {
        let votes: Vec<VoteTransaction> = serde_json::from_str(&self.votes).map_err(|err| {
            LedgerError::Codec(format!("block {} votes blob: {err}", self.index))
        })?;
        Ok(Block {
            index: self.index,
            previous_hash: self.previous_hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            election_id: self.election_id,
            nonce: self.nonce,
            hash: self.hash,
            votes,
        })
    }
}

/// A whole election chain as a single JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDocument {
    /// Schema identifier (`ballot_ledger.chain.v1`).
    pub schema: String,
    /// Election the chain belongs to.
    pub election_id: String,
    /// Difficulty the chain was mined at.
    pub difficulty: usize,
    /// Blocks in chain order.
    pub blocks: Vec<BlockRecord>,
}

impl ChainDocument {
    /// Captures a chain snapshot.
    pub fn from_chain(chain: &Chain) -> Result<Self, LedgerError> {
        let blocks = chain
            .blocks()
            .iter()
            .map(|block| BlockRecord::from_block(block))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: CHAIN_SCHEMA.to_string(),
            election_id: chain.election_id().to_string(),
            difficulty: chain.difficulty(),
            blocks,
        })
    }

    /// Rebuilds an unvalidated chain from the document.
    pub fn into_chain(self) -> Result<Chain, LedgerError> {
        if self.schema != CHAIN_SCHEMA {
            return Err(LedgerError::Codec(format!(
                "unexpected chain schema {}",
                self.schema
            )));
        }
        let blocks = self
            .blocks
            .into_iter()
            .map(BlockRecord::into_block)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Chain::from_blocks(&self.election_id, self.difficulty, blocks))
    }
}

/// Writes a chain document next to `path` and renames it into place.
pub fn write_chain_file(path: &Path, chain: &Chain) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let document = ChainDocument::from_chain(chain)?;
    let contents = serde_json::to_string_pretty(&document)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reads a chain document written by [`write_chain_file`].
pub fn load_chain_file(path: &Path) -> Result<ChainDocument, LedgerError> {
    let contents = fs::read_to_string(path)
        .map_err(|err| LedgerError::Io(format!("{}: {err}", path.display())))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::UnminedBlock;
    use crate::chain::ValidationOptions;
    use crate::sign::keypair_from_seed;

    fn sample_chain() -> Chain {
        let mut chain = Chain::new("e-rec", 1).unwrap();
        let votes = (0..3)
            .map(|i| {
                let keys = keypair_from_seed(&format!("rec-{i}"));
                VoteTransaction::signed(&keys, "e-rec", "c", i).unwrap()
            })
            .collect();
        let block = UnminedBlock::assemble(1, chain.head_hash().to_string(), "e-rec".into(), votes)
            .unwrap()
            .mine(1)
            .unwrap();
        chain.append(block).unwrap();
        chain
    }

    #[test]
    fn record_round_trip_preserves_block() {
        let chain = sample_chain();
        let block = &chain.blocks()[1];
        let record = BlockRecord::from_block(block).unwrap();
        assert!(record.votes.starts_with("[{\"candidateId\""));
        assert_eq!(&record.clone().into_block().unwrap(), block.as_ref());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("previousHash").is_some());
        assert!(json["votes"].is_string());
    }

    #[test]
    fn corrupt_votes_blob_is_a_codec_error() {
        let mut record = BlockRecord::from_block(&sample_chain().blocks()[1]).unwrap();
        record.votes = "{not json".into();
        assert!(matches!(record.into_block(), Err(LedgerError::Codec(_))));
    }

    #[test]
    fn chain_file_round_trip_validates() {
        let dir = std::env::temp_dir().join(format!("ballot_ledger_rec_{}", std::process::id()));
        let path = dir.join("chain.json");
        write_chain_file(&path, &sample_chain()).unwrap();
        let chain = load_chain_file(&path).unwrap().into_chain().unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain.validate_full(ValidationOptions::default()).is_valid);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn wrong_schema_is_rejected() {
        let mut document = ChainDocument::from_chain(&sample_chain()).unwrap();
        document.schema = "other".into();
        assert!(document.into_chain().is_err());
    }
}
