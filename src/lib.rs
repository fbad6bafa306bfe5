//! Core library for the ledger-tools command line application.
//!
//! Ledger entities are edited through change-tracked items held in
//! [`ledger::model`]; pending changes are reconciled with a store in batches
//! by [`ledger::sync`]. Storage adapters for the xlsx backup format and the
//! SQLite database live under [`ledger::io`], verified backups in
//! [`ledger::backup`], and [`ledger::session`] ties them together for the
//! command-line interface and the integration tests.

pub mod ledger;

pub use ledger::{
    LedgerError, Result, backup, config, error, io, model, progress, session, sync, worker,
};
