use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::progress::DEFAULT_REPORT_INTERVAL;

pub const DEFAULT_BATCH_SIZE: i64 = 50;

/// Tunables shared by every long-running operation.
///
/// Missing keys take their defaults, so an empty JSON object is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Statements per commit. Zero or negative commits once at the end.
    pub batch_size: i64,
    /// Steps between progress reports.
    pub report_interval: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

impl LedgerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LedgerError::MissingInput(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&raw)
            .map_err(|err| LedgerError::Config(format!("{}: {err}", path.display())))
    }

    pub fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(raw)?;
        config.report_interval = config.report_interval.max(1);
        Ok(config)
    }
}
