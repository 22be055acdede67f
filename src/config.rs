//! Engine configuration.
//!
//! Loaded from TOML. Every field has a default so an empty document yields a
//! usable configuration.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// How many times a unit of work is re-run after an optimistic concurrency
    /// conflict before the conflict is reported.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Flush sled to disk after each committed unit of work.
    #[serde(default)]
    pub flush_on_commit: bool,

    /// Refuse regular-member approve/reject while any issue is open.
    #[serde(default)]
    pub block_regular_decisions_on_open_issues: bool,

    /// When the final approver may reject.
    #[serde(default)]
    pub final_reject_gate: FinalRejectGate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalRejectGate {
    /// Every regular member has decided and no issue is open. Readiness is not
    /// required, so a regular rejection can be confirmed.
    #[default]
    AllDecided,
    /// Rejection needs the same readiness as approval.
    Ready,
}

fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            flush_on_commit: false,
            block_regular_decisions_on_open_issues: false,
            final_reject_gate: FinalRejectGate::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("parsing engine config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
