pub mod backup;
pub mod config;
pub mod error;
pub mod io;
pub mod model;
pub mod progress;
pub mod session;
pub mod sync;
pub mod worker;

pub use error::{LedgerError, Result};
