use std::path::Path;

use tracing::{info, instrument, warn};

use crate::ledger::backup;
use crate::ledger::config::LedgerConfig;
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::io::database::Database;
use crate::ledger::io::excel_read::SheetReader;
use crate::ledger::model::DataSet;
use crate::ledger::progress::{Outcome, ProgressController};
use crate::ledger::sync::BatchSynchronizer;

/// Owns the active data set. Loads and restores replace it only when they
/// finish; a failed or cancelled load leaves the previous data in place.
#[derive(Debug, Default)]
pub struct Session {
    data: DataSet,
    config: LedgerConfig,
}

fn begin(ctl: &mut ProgressController, stages: usize) -> Result<()> {
    if ctl.set_num_stages(stages) {
        Ok(())
    } else {
        Outcome::Cancelled.into_result()
    }
}

impl Session {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            data: DataSet::new(),
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn data(&self) -> &DataSet {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataSet {
        &mut self.data
    }

    #[instrument(level = "info", skip_all)]
    pub fn load_database(&mut self, db: &Database, ctl: &mut ProgressController) -> Result<()> {
        begin(ctl, Database::LOAD_STAGES)?;
        let data = db.load(ctl)?.into_result()?;
        ctl.complete();
        self.data = data;
        Ok(())
    }

    /// Validates the data set and writes every pending change to `db`.
    ///
    /// Items of batches committed before a failure are settled all the same.
    /// Returns the number of settled items.
    #[instrument(level = "info", skip_all, fields(batch_size = self.config.batch_size))]
    pub fn store_database(
        &mut self,
        db: &mut Database,
        ctl: &mut ProgressController,
    ) -> Result<usize> {
        if !self.data.validate() {
            return Err(LedgerError::consistency(
                "the data set has validation errors",
            ));
        }
        begin(ctl, BatchSynchronizer::STAGE_COUNT)?;

        let mut snapshot = self.data.update_snapshot();
        let mut sync = BatchSynchronizer::new(self.config.batch_size);
        let result = sync.store(&mut snapshot, db, ctl);
        let applied = self.data.apply_settlements(sync.settled());
        if let Err(error) = &result {
            warn!(applied, %error, "store failed after settling committed batches");
        }
        result?.into_result()?;

        ctl.complete();
        info!(applied, commits = sync.commits(), "data set stored");
        Ok(applied)
    }

    pub fn create_backup(&self, path: &Path, ctl: &mut ProgressController) -> Result<()> {
        backup::create_backup(&self.data, path, self.config.batch_size, ctl)?.into_result()
    }

    /// Replaces the data set with the contents of a backup workbook.
    #[instrument(level = "info", skip(self, ctl), fields(input = %path.display()))]
    pub fn restore_backup(&mut self, path: &Path, ctl: &mut ProgressController) -> Result<()> {
        if !path.exists() {
            return Err(LedgerError::MissingInput(path.to_path_buf()));
        }
        begin(ctl, SheetReader::STAGE_COUNT)?;
        let data = SheetReader::new(path).load(ctl)?.into_result()?;
        ctl.complete();
        self.data = data;
        Ok(())
    }

    /// Empties `db` and writes the whole data set into it, ids kept.
    #[instrument(level = "info", skip_all)]
    pub fn restore_into_database(
        &mut self,
        db: &mut Database,
        ctl: &mut ProgressController,
    ) -> Result<()> {
        if self.data.has_updates() {
            return Err(LedgerError::consistency(
                "cannot restore a data set with unsaved changes",
            ));
        }
        begin(ctl, BatchSynchronizer::STAGE_COUNT + 1)?;
        if !ctl.set_new_stage("Purging database") {
            return Outcome::Cancelled.into_result();
        }
        db.purge()?;

        let mut snapshot = self.data.full_snapshot();
        let mut sync = BatchSynchronizer::new(self.config.batch_size);
        sync.store(&mut snapshot, db, ctl)?.into_result()?;
        ctl.complete();
        info!(items = sync.writes(), "database restored");
        Ok(())
    }
}
