//! Ledger data model: the entity schema, change-tracked items, editable lists
//! and the data set that groups one list per entity kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

pub mod dataset;
pub mod entities;
pub mod item;
pub mod list;

pub use dataset::{DataSet, DataSetDiff};
pub use entities::{Account, AccountCategory, TaxYear, Transaction};
pub use item::{EditState, HISTORY_DEPTH, Item, ItemKey, ItemState};
pub use list::{DataList, ListStyle, SettleAction, Settled, StateFilter};

/// Field name → validation message.
pub type FieldErrors = BTreeMap<&'static str, String>;

/// Closed set of entity kinds handled by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    TaxYear,
    Account,
    Transaction,
}

impl EntityKind {
    /// Referenced tables come before the tables that reference them.
    pub const INSERT_ORDER: [EntityKind; 3] = [
        EntityKind::TaxYear,
        EntityKind::Account,
        EntityKind::Transaction,
    ];

    pub fn delete_order() -> impl Iterator<Item = EntityKind> {
        Self::INSERT_ORDER.into_iter().rev()
    }

    /// Relational table name.
    pub fn table_name(self) -> &'static str {
        match self {
            EntityKind::TaxYear => "tax_years",
            EntityKind::Account => "accounts",
            EntityKind::Transaction => "transactions",
        }
    }

    /// Worksheet name inside a backup workbook.
    pub fn sheet_name(self) -> &'static str {
        match self {
            EntityKind::TaxYear => "TaxYears",
            EntityKind::Account => "Accounts",
            EntityKind::Transaction => "Transactions",
        }
    }

    /// Ordered value columns, excluding the leading `id` column.
    pub fn columns(self) -> &'static [Column] {
        match self {
            EntityKind::TaxYear => TAX_YEAR_COLUMNS,
            EntityKind::Account => ACCOUNT_COLUMNS,
            EntityKind::Transaction => TRANSACTION_COLUMNS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::TaxYear => write!(f, "tax years"),
            EntityKind::Account => write!(f, "accounts"),
            EntityKind::Transaction => write!(f, "transactions"),
        }
    }
}

/// Name of the primary key column shared by every table and sheet.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Decimal,
    Date,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn column(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

const TAX_YEAR_COLUMNS: &[Column] = &[
    column("year", ColumnType::Integer),
    column("allowance", ColumnType::Decimal),
    column("basic_rate", ColumnType::Decimal),
];

const ACCOUNT_COLUMNS: &[Column] = &[
    column("name", ColumnType::Text),
    column("category", ColumnType::Text),
    column("opening_balance", ColumnType::Decimal),
    column("closed", ColumnType::Bool),
];

const TRANSACTION_COLUMNS: &[Column] = &[
    column("date", ColumnType::Date),
    column("debit", ColumnType::Text),
    column("credit", ColumnType::Text),
    column("amount", ColumnType::Decimal),
    column("description", ColumnType::Text),
];

/// Date layout used wherever a date is stored as text.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single typed cell of a row, independent of the backend storing it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Date(NaiveDate),
    Bool(bool),
}

impl FieldValue {
    /// Parses the textual form of a value for the given column type.
    pub fn parse(ty: ColumnType, raw: &str) -> Result<Self, RowError> {
        let invalid = || RowError::InvalidValue {
            value: raw.to_string(),
            ty,
        };
        let raw_trimmed = raw.trim();
        Ok(match ty {
            ColumnType::Text => FieldValue::Text(raw.to_string()),
            ColumnType::Integer => {
                FieldValue::Integer(raw_trimmed.parse().map_err(|_| invalid())?)
            }
            ColumnType::Decimal => {
                FieldValue::Decimal(Decimal::from_str(raw_trimmed).map_err(|_| invalid())?)
            }
            ColumnType::Date => FieldValue::Date(
                NaiveDate::parse_from_str(raw_trimmed, DATE_FORMAT).map_err(|_| invalid())?,
            ),
            ColumnType::Bool => match raw_trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" => FieldValue::Bool(true),
                "false" | "0" => FieldValue::Bool(false),
                _ => return Err(invalid()),
            },
        })
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldValue::Text(_) => ColumnType::Text,
            FieldValue::Integer(_) => ColumnType::Integer,
            FieldValue::Decimal(_) => ColumnType::Decimal,
            FieldValue::Date(_) => ColumnType::Date,
            FieldValue::Bool(_) => ColumnType::Bool,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(value) => f.write_str(value),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Decimal(value) => write!(f, "{value}"),
            FieldValue::Date(value) => write!(f, "{}", value.format(DATE_FORMAT)),
            FieldValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// Raised when a stored row cannot be turned back into an entity.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("expected {expected} columns, found {found}")]
    Width { expected: usize, found: usize },

    #[error("column {column} holds a {found:?} value, expected {expected:?}")]
    Type {
        column: &'static str,
        expected: ColumnType,
        found: ColumnType,
    },

    #[error("'{value}' is not a valid {ty:?} value")]
    InvalidValue { value: String, ty: ColumnType },

    #[error("column {column}: {message}")]
    Domain {
        column: &'static str,
        message: String,
    },
}

/// Positional accessor used by [`Entity::from_row`] implementations.
pub struct RowReader<'a> {
    kind: EntityKind,
    row: &'a [FieldValue],
}

impl<'a> RowReader<'a> {
    pub fn new(kind: EntityKind, row: &'a [FieldValue]) -> Result<Self, RowError> {
        let expected = kind.columns().len();
        if row.len() != expected {
            return Err(RowError::Width {
                expected,
                found: row.len(),
            });
        }
        Ok(Self { kind, row })
    }

    fn cell(&self, index: usize) -> (&'static str, &'a FieldValue) {
        (self.kind.columns()[index].name, &self.row[index])
    }

    fn mismatch(column: &'static str, expected: ColumnType, found: &FieldValue) -> RowError {
        RowError::Type {
            column,
            expected,
            found: found.column_type(),
        }
    }

    pub fn text(&self, index: usize) -> Result<String, RowError> {
        match self.cell(index) {
            (_, FieldValue::Text(value)) => Ok(value.clone()),
            (column, other) => Err(Self::mismatch(column, ColumnType::Text, other)),
        }
    }

    pub fn integer(&self, index: usize) -> Result<i64, RowError> {
        match self.cell(index) {
            (_, FieldValue::Integer(value)) => Ok(*value),
            (column, other) => Err(Self::mismatch(column, ColumnType::Integer, other)),
        }
    }

    pub fn decimal(&self, index: usize) -> Result<Decimal, RowError> {
        match self.cell(index) {
            (_, FieldValue::Decimal(value)) => Ok(*value),
            (column, other) => Err(Self::mismatch(column, ColumnType::Decimal, other)),
        }
    }

    pub fn date(&self, index: usize) -> Result<NaiveDate, RowError> {
        match self.cell(index) {
            (_, FieldValue::Date(value)) => Ok(*value),
            (column, other) => Err(Self::mismatch(column, ColumnType::Date, other)),
        }
    }

    pub fn boolean(&self, index: usize) -> Result<bool, RowError> {
        match self.cell(index) {
            (_, FieldValue::Bool(value)) => Ok(*value),
            (column, other) => Err(Self::mismatch(column, ColumnType::Bool, other)),
        }
    }

    pub fn domain(&self, index: usize, message: impl Into<String>) -> RowError {
        RowError::Domain {
            column: self.kind.columns()[index].name,
            message: message.into(),
        }
    }
}

/// A financial entity whose values can be change-tracked and persisted.
///
/// Each implementation names its [`EntityKind`] tag and the slot of the
/// [`DataSet`] that owns its list, so generic code selects the right list by
/// tag instead of inspecting types at runtime.
pub trait Entity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    const KIND: EntityKind;

    /// Values in [`EntityKind::columns`] order.
    fn to_row(&self) -> Vec<FieldValue>;

    fn from_row(row: &[FieldValue]) -> Result<Self, RowError>;

    /// Records per-field problems into `errors`.
    fn validate(&self, errors: &mut FieldErrors);

    fn list(set: &DataSet) -> &DataList<Self>;

    fn list_mut(set: &mut DataSet) -> &mut DataList<Self>;
}

/// Entities with a unique natural key.
pub trait Keyed: Entity {
    type Key: Ord + Clone + fmt::Debug;

    fn natural_key(&self) -> Self::Key;

    /// Field that carries the natural key, used to report duplicates.
    const KEY_FIELD: &'static str;
}
