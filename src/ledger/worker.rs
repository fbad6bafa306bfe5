//! Runs one long operation off the calling thread.
//!
//! The operation owns its [`ProgressController`] on a scoped worker thread;
//! every published [`ProgressStatus`] is sent back over a channel and handed
//! to `on_status` on the calling thread, in order. The call returns once the
//! worker has finished, so anything the operation borrows stays exclusively
//! borrowed for its whole run.

use std::sync::mpsc;
use std::thread;

use tracing::error;

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::progress::{CancelToken, ProgressController, ProgressStatus};

pub fn run_with_progress<T, F, S>(
    cancel: CancelToken,
    report_interval: usize,
    operation: F,
    mut on_status: S,
) -> Result<T>
where
    T: Send,
    F: FnOnce(&mut ProgressController) -> Result<T> + Send,
    S: FnMut(&ProgressStatus),
{
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name("ledger-worker".to_string())
            .spawn_scoped(scope, move || {
                let mut ctl = ProgressController::new(cancel)
                    .with_report_interval(report_interval)
                    .with_publisher(move |status| {
                        // The receiver outlives the worker.
                        let _ = tx.send(status);
                    });
                operation(&mut ctl)
            })
            .map_err(|err| LedgerError::consistency(format!("cannot start worker: {err}")))?;

        for status in rx {
            on_status(&status);
        }

        worker.join().unwrap_or_else(|_| {
            error!("worker thread panicked");
            Err(LedgerError::consistency("worker thread panicked"))
        })
    })
}
