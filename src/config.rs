//! Ledger configuration.
//!
//! Values come from an optional JSON file, are overridden by `BALLOT_LEDGER_*`
//! environment variables, and are checked by [`LedgerConfig::validate`] before
//! a [`LedgerManager`](crate::LedgerManager) accepts them.

use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

use crate::error::LedgerError;

/// Largest accepted difficulty: every hex character of a 32-byte digest.
pub const MAX_DIFFICULTY: usize = 64;

/// When a full pending pool is sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealMode {
    /// The submitting call mines the block before returning.
    Inline,
    /// Submission returns immediately; a background worker mines.
    Deferred,
}

/// What happens to pending votes when an election closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Seal every pending vote, in as many blocks as needed.
    Flush,
    /// Leave pending votes unsealed for an explicit operator decision.
    Retain,
}

/// Tunables shared by every election in a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Required leading zero hex characters in every block hash.
    pub difficulty: usize,
    /// Pool size that triggers sealing, and the cap on votes per block.
    pub max_votes_per_block: usize,
    /// Whether a full pool is sealed inline or by the worker.
    pub seal_mode: SealMode,
    /// Allow sealing a block with no votes.
    pub allow_empty_blocks: bool,
    /// Pending-vote handling at election close.
    pub close_policy: ClosePolicy,
    /// Spot-check Merkle inclusion during full validation.
    pub verify_inclusion: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: 2,
            max_votes_per_block: 10,
            seal_mode: SealMode::Inline,
            allow_empty_blocks: false,
            close_policy: ClosePolicy::Flush,
            verify_inclusion: true,
        }
    }
}

impl LedgerConfig {
    /// Loads a JSON config file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| LedgerError::Io(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))
    }

    /// Loads `path` if given, applies environment overrides and validates.
    pub fn resolve(path: Option<&Path>) -> Result<Self, LedgerError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `BALLOT_LEDGER_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), LedgerError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), LedgerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BALLOT_LEDGER_DIFFICULTY") {
            self.difficulty = parse_number("BALLOT_LEDGER_DIFFICULTY", &value)?;
        }
        if let Some(value) = lookup("BALLOT_LEDGER_MAX_VOTES_PER_BLOCK") {
            self.max_votes_per_block = parse_number("BALLOT_LEDGER_MAX_VOTES_PER_BLOCK", &value)?;
        }
        if let Some(value) = lookup("BALLOT_LEDGER_SEAL_MODE") {
            self.seal_mode = match value.trim().to_ascii_lowercase().as_str() {
                "inline" => SealMode::Inline,
                "deferred" => SealMode::Deferred,
                other => {
                    return Err(LedgerError::Config(format!(
                        "BALLOT_LEDGER_SEAL_MODE must be inline or deferred, got {other}"
                    )))
                }
            };
        }
        if let Some(value) = lookup("BALLOT_LEDGER_CLOSE_POLICY") {
            self.close_policy = match value.trim().to_ascii_lowercase().as_str() {
                "flush" => ClosePolicy::Flush,
                "retain" => ClosePolicy::Retain,
                other => {
                    return Err(LedgerError::Config(format!(
                        "BALLOT_LEDGER_CLOSE_POLICY must be flush or retain, got {other}"
                    )))
                }
            };
        }
        if let Some(value) = lookup("BALLOT_LEDGER_ALLOW_EMPTY_BLOCKS") {
            self.allow_empty_blocks = parse_flag("BALLOT_LEDGER_ALLOW_EMPTY_BLOCKS", &value)?;
        }
        if let Some(value) = lookup("BALLOT_LEDGER_VERIFY_INCLUSION") {
            self.verify_inclusion = parse_flag("BALLOT_LEDGER_VERIFY_INCLUSION", &value)?;
        }
        Ok(())
    }

    /// Rejects out-of-range values.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(LedgerError::Config(format!(
                "difficulty {} exceeds {MAX_DIFFICULTY}",
                self.difficulty
            )));
        }
        if self.max_votes_per_block == 0 {
            return Err(LedgerError::Config(
                "max_votes_per_block must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, LedgerError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| LedgerError::Config(format!("{key} must be a non-negative integer")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, LedgerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LedgerError::Config(format!("{key} must be a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"difficulty": 3, "seal_mode": "deferred"}"#).unwrap();
        assert_eq!(config.difficulty, 3);
        assert_eq!(config.seal_mode, SealMode::Deferred);
        assert_eq!(config.max_votes_per_block, 10);
        assert_eq!(config.close_policy, ClosePolicy::Flush);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("BALLOT_LEDGER_MAX_VOTES_PER_BLOCK", "5"),
            ("BALLOT_LEDGER_CLOSE_POLICY", "retain"),
            ("BALLOT_LEDGER_ALLOW_EMPTY_BLOCKS", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = LedgerConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_votes_per_block, 5);
        assert_eq!(config.close_policy, ClosePolicy::Retain);
        assert!(config.allow_empty_blocks);
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = LedgerConfig::default();
        let err = config
            .apply_overrides(|key| (key == "BALLOT_LEDGER_SEAL_MODE").then(|| "eager".to_string()))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn validate_bounds() {
        let mut config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        config.max_votes_per_block = 0;
        assert!(config.validate().is_err());
        config.max_votes_per_block = 1;
        config.difficulty = MAX_DIFFICULTY + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = env::temp_dir().join(format!("ballot_ledger_cfg_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ledger.json");
        fs::write(&path, r#"{"max_votes_per_block": 7}"#).unwrap();
        assert_eq!(LedgerConfig::load(&path).unwrap().max_votes_per_block, 7);
        assert!(LedgerConfig::load(&dir.join("missing.json")).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
