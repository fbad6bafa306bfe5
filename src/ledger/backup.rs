//! Workbook backups that are only kept once they read back identically.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::io::excel_read::SheetReader;
use crate::ledger::io::excel_write::SheetBackend;
use crate::ledger::model::DataSet;
use crate::ledger::progress::{Outcome, ProgressController};
use crate::ledger::sync::BatchSynchronizer;

/// Synchronisation, saving, reading back and comparing.
pub const STAGE_COUNT: usize = BatchSynchronizer::STAGE_COUNT + 1 + SheetReader::STAGE_COUNT + 1;

/// Deletes the backup file on drop unless [`keep`](Self::keep) was called.
struct ArtifactGuard {
    path: PathBuf,
    keep: bool,
}

impl ArtifactGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            keep: false,
        }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(path = %self.path.display(), "discarded incomplete backup"),
            Err(err) if err.kind() == IoErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), %err, "could not remove backup"),
        }
    }
}

/// Writes every live item of `data` to a new workbook at `path`.
#[instrument(level = "info", skip(data, ctl), fields(output = %path.display()))]
pub fn write_backup(
    data: &DataSet,
    path: &Path,
    batch_size: i64,
    ctl: &mut ProgressController,
) -> Result<Outcome> {
    let mut snapshot = data.full_snapshot();
    let mut sheets = SheetBackend::new();
    let mut sync = BatchSynchronizer::new(batch_size);
    if sync.store(&mut snapshot, &mut sheets, ctl)?.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }

    if !ctl.set_new_stage("Saving backup") {
        return Ok(Outcome::Cancelled);
    }
    sheets.save(path)?;
    Ok(Outcome::Completed(()))
}

/// Reads the workbook at `path` back and compares it with `expected`.
///
/// A mismatch fails with the differing items attached to the error.
#[instrument(level = "info", skip(expected, ctl), fields(input = %path.display()))]
pub fn verify_backup(
    expected: &DataSet,
    path: &Path,
    ctl: &mut ProgressController,
) -> Result<Outcome> {
    let reread = match SheetReader::new(path).load(ctl)? {
        Outcome::Completed(data) => data,
        Outcome::Cancelled => return Ok(Outcome::Cancelled),
    };

    if !ctl.set_new_stage("Comparing backup") {
        return Ok(Outcome::Cancelled);
    }
    let diff = expected.diff(&reread);
    if diff.is_empty() {
        return Ok(Outcome::Completed(()));
    }
    warn!(differences = diff.len(), "backup does not match the data set");
    Err(LedgerError::mismatch(
        format!(
            "backup {} differs from the data set in {} item(s)",
            path.display(),
            diff.len()
        ),
        diff,
    ))
}

/// Writes and verifies a backup of `data`. The file is removed again unless
/// the verification passes.
///
/// Refused while `data` has unsaved changes or when `path` already exists.
pub fn create_backup(
    data: &DataSet,
    path: &Path,
    batch_size: i64,
    ctl: &mut ProgressController,
) -> Result<Outcome> {
    if data.has_updates() {
        return Err(LedgerError::consistency(
            "save pending changes before creating a backup",
        ));
    }
    if path.exists() {
        return Err(LedgerError::excel(format!(
            "backup target {} already exists",
            path.display()
        )));
    }
    if !ctl.set_num_stages(STAGE_COUNT) {
        return Ok(Outcome::Cancelled);
    }

    let guard = ArtifactGuard::new(path);
    if write_backup(data, path, batch_size, ctl)?.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    if verify_backup(data, path, ctl)?.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    guard.keep();

    ctl.complete();
    info!(items = data.total_items(), output = %path.display(), "backup verified");
    Ok(Outcome::Completed(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::ledger::error::{ErrorKind, CANCELLED_MESSAGE};
    use crate::ledger::model::{Account, AccountCategory};
    use crate::ledger::progress::CancelToken;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn stored_accounts(names: &[&str]) -> DataSet {
        let mut data = DataSet::new();
        for (offset, name) in names.iter().enumerate() {
            data.accounts
                .push_loaded(
                    offset as i64 + 1,
                    Account {
                        name: name.to_string(),
                        category: AccountCategory::Savings,
                        opening_balance: dec!(250.75),
                        closed: false,
                    },
                )
                .unwrap();
        }
        data
    }

    #[test]
    fn guard_removes_the_file_unless_kept() {
        let dir = tempdir().unwrap();
        let dropped = dir.path().join("dropped.xlsx");
        let kept = dir.path().join("kept.xlsx");
        std::fs::write(&dropped, b"partial").unwrap();
        std::fs::write(&kept, b"verified").unwrap();

        drop(ArtifactGuard::new(&dropped));
        ArtifactGuard::new(&kept).keep();

        assert!(!dropped.exists());
        assert!(kept.exists());
        // A file that was never written is not an error.
        drop(ArtifactGuard::new(&dir.path().join("never.xlsx")));
    }

    #[test]
    fn cancelled_backup_removes_the_workbook() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.xlsx");
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let watched = path.clone();
        let saved = Arc::new(AtomicBool::new(false));
        let seen_saved = Arc::clone(&saved);
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stages);
        let mut ctl = ProgressController::new(cancel).with_publisher(move |status| {
            if status.stage == "Loading transactions" {
                seen_saved.store(watched.exists(), Ordering::SeqCst);
                trigger.cancel();
            }
            sink.lock().unwrap().push(status.stage);
        });

        let outcome = create_backup(&stored_accounts(&["Bank", "Shop"]), &path, 1, &mut ctl).unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(saved.load(Ordering::SeqCst));
        assert!(!path.exists());
        assert!(
            !stages
                .lock()
                .unwrap()
                .iter()
                .any(|stage| stage == "Comparing backup")
        );

        let err = outcome.into_result().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string().matches(CANCELLED_MESSAGE).count(), 1);
    }

    #[test]
    fn failed_save_leaves_no_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("backup.xlsx");

        let err = create_backup(
            &stored_accounts(&["Bank"]),
            &path,
            10,
            &mut ProgressController::detached(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExcelFormat);
        assert!(!path.exists());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn existing_target_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.xlsx");
        std::fs::write(&path, b"keep me").unwrap();

        let err = create_backup(
            &stored_accounts(&["Bank"]),
            &path,
            10,
            &mut ProgressController::detached(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExcelFormat);
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[test]
    fn stage_count_covers_every_stage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.xlsx");
        let mut ctl = ProgressController::detached();
        create_backup(&stored_accounts(&["Bank"]), &path, 0, &mut ctl)
            .unwrap()
            .into_result()
            .unwrap();
        let status = ctl.status();
        assert_eq!(status.num_stages, STAGE_COUNT);
        assert_eq!(status.stages_done, STAGE_COUNT);
    }
}
