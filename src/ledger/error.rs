use std::error::Error as StdError;
use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::model::DataSetDiff;

/// Convenient alias for fallible results returned throughout the crate.
pub type Result<T> = std::result::Result<T, LedgerError>;

type Source = Box<dyn StdError + Send + Sync + 'static>;

/// Message carried by the error raised when an operation is cancelled.
pub const CANCELLED_MESSAGE: &str = "Operation Cancelled";

/// Coarse classification of [`LedgerError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ExcelFormat,
    Persistence,
    DataConsistency,
    Config,
    MissingInput,
    Logging,
}

/// Error type covering the failures that can occur while loading, storing or
/// verifying ledger data.
///
/// Driver and I/O failures never escape as-is: they are wrapped into one of
/// the storage kinds at the point where they happen, with the original cause
/// kept as the error source.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading or writing a spreadsheet workbook failed.
    #[error("spreadsheet error: {message}")]
    ExcelFormat {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// The relational store reported a failure.
    #[error("persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Source>,
    },

    /// Data failed a logical check: round-trip mismatch, cancellation,
    /// validation failure or a broken invariant.
    #[error("data consistency error: {message}")]
    DataConsistency {
        message: String,
        diff: Option<Box<DataSetDiff>>,
    },

    /// Raised when the configuration file cannot be read or parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Raised when the user provides a path that does not exist.
    #[error("input file not found: {0}")]
    MissingInput(PathBuf),

    /// Raised when the tracing subscriber fails to initialise.
    #[error("failed to initialise logging: {0}")]
    Logging(String),
}

impl LedgerError {
    pub fn excel(message: impl Into<String>) -> Self {
        Self::ExcelFormat {
            message: message.into(),
            source: None,
        }
    }

    pub fn excel_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::ExcelFormat {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: None,
        }
    }

    pub fn persistence_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Persistence {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::DataConsistency {
            message: message.into(),
            diff: None,
        }
    }

    /// Round-trip mismatch carrying the offending differences.
    pub fn mismatch(message: impl Into<String>, diff: DataSetDiff) -> Self {
        Self::DataConsistency {
            message: message.into(),
            diff: Some(Box::new(diff)),
        }
    }

    pub fn cancelled() -> Self {
        Self::consistency(CANCELLED_MESSAGE)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ExcelFormat { .. } => ErrorKind::ExcelFormat,
            Self::Persistence { .. } => ErrorKind::Persistence,
            Self::DataConsistency { .. } => ErrorKind::DataConsistency,
            Self::Config(_) => ErrorKind::Config,
            Self::MissingInput(_) => ErrorKind::MissingInput,
            Self::Logging(_) => ErrorKind::Logging,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::DataConsistency { message, .. } if message == CANCELLED_MESSAGE)
    }

    /// Differences attached to a failed round-trip verification.
    pub fn diff(&self) -> Option<&DataSetDiff> {
        match self {
            Self::DataConsistency { diff, .. } => diff.as_deref(),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(error: rusqlite::Error) -> Self {
        let message = error.to_string();
        Self::persistence_with(message, error)
    }
}

impl From<calamine::XlsxError> for LedgerError {
    fn from(error: calamine::XlsxError) -> Self {
        let message = error.to_string();
        Self::excel_with(message, error)
    }
}

impl From<rust_xlsxwriter::XlsxError> for LedgerError {
    fn from(error: rust_xlsxwriter::XlsxError) -> Self {
        let message = error.to_string();
        Self::excel_with(message, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_a_consistency_error() {
        let err = LedgerError::cancelled();
        assert_eq!(err.kind(), ErrorKind::DataConsistency);
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "data consistency error: Operation Cancelled");
    }

    #[test]
    fn driver_errors_keep_their_source() {
        let err = LedgerError::from(rusqlite::Error::InvalidQuery);
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert!(err.source().is_some());
    }
}
