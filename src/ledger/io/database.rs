//! SQLite store: one table per entity kind, keyed by an integer `id`.

use std::path::Path;

use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{Connection, Row};
use tracing::{debug, info, instrument};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::model::{
    Account, Column, ColumnType, DATE_FORMAT, DataSet, Entity, EntityKind, FieldValue, ID_COLUMN,
    TaxYear, Transaction,
};
use crate::ledger::progress::{Outcome, ProgressController};
use crate::ledger::sync::{Backend, Phase};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tax_years (
    id INTEGER PRIMARY KEY,
    year INTEGER NOT NULL UNIQUE,
    allowance TEXT NOT NULL,
    basic_rate TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL,
    opening_balance TEXT NOT NULL,
    closed INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    debit TEXT NOT NULL REFERENCES accounts(name) ON UPDATE CASCADE,
    credit TEXT NOT NULL REFERENCES accounts(name) ON UPDATE CASCADE,
    amount TEXT NOT NULL,
    description TEXT NOT NULL
);
";

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Text(value) => ToSqlOutput::from(value.as_str()),
            FieldValue::Integer(value) => ToSqlOutput::from(*value),
            FieldValue::Decimal(value) => ToSqlOutput::from(value.to_string()),
            FieldValue::Date(value) => ToSqlOutput::from(value.format(DATE_FORMAT).to_string()),
            FieldValue::Bool(value) => ToSqlOutput::from(*value),
        })
    }
}

fn column_list(kind: EntityKind) -> String {
    kind.columns()
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(kind: EntityKind) -> String {
    let placeholders = (1..=kind.columns().len() + 1)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({ID_COLUMN}, {}) VALUES ({placeholders})",
        kind.table_name(),
        column_list(kind)
    )
}

fn update_sql(kind: EntityKind) -> String {
    let columns = kind.columns();
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{} = ?{}", column.name, index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {assignments} WHERE {ID_COLUMN} = ?{}",
        kind.table_name(),
        columns.len() + 1
    )
}

fn delete_sql(kind: EntityKind) -> String {
    format!("DELETE FROM {} WHERE {ID_COLUMN} = ?1", kind.table_name())
}

fn select_sql(kind: EntityKind) -> String {
    format!(
        "SELECT {ID_COLUMN}, {} FROM {} ORDER BY {ID_COLUMN}",
        column_list(kind),
        kind.table_name()
    )
}

fn statement_sql(kind: EntityKind, phase: Phase) -> String {
    match phase {
        Phase::Insert => insert_sql(kind),
        Phase::Update => update_sql(kind),
        Phase::Delete => delete_sql(kind),
    }
}

/// Relational ledger store.
///
/// Writes open a transaction lazily; it stays open until the synchronizer
/// commits or rolls back the batch.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
    in_batch: bool,
    prepared: Option<(EntityKind, Phase, String)>,
}

impl Database {
    /// One stage per table.
    pub const LOAD_STAGES: usize = EntityKind::INSERT_ORDER.len();

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            LedgerError::persistence_with(format!("cannot open database {}", path.display()), err)
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self {
            conn,
            in_batch: false,
            prepared: None,
        })
    }

    /// Creates any missing tables.
    pub fn create_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Removes every row, dependents first, in one transaction.
    #[instrument(level = "info", skip_all)]
    pub fn purge(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        for kind in EntityKind::delete_order() {
            let removed = tx.execute(&format!("DELETE FROM {}", kind.table_name()), [])?;
            debug!(%kind, removed, "table purged");
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count(&self, kind: EntityKind) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", kind.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Reads every table, referenced tables first.
    #[instrument(level = "info", skip_all)]
    pub fn load(&self, ctl: &mut ProgressController) -> Result<Outcome<DataSet>> {
        let mut data = DataSet::new();
        for kind in EntityKind::INSERT_ORDER {
            if !ctl.set_new_stage(format!("Loading {kind}")) {
                return Ok(Outcome::Cancelled);
            }
            let outcome = match kind {
                EntityKind::TaxYear => self.load_table::<TaxYear>(&mut data, ctl)?,
                EntityKind::Account => self.load_table::<Account>(&mut data, ctl)?,
                EntityKind::Transaction => self.load_table::<Transaction>(&mut data, ctl)?,
            };
            if outcome.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }
        info!(items = data.total_items(), "read data set from database");
        Ok(Outcome::Completed(data))
    }

    fn load_table<T: Entity>(&self, data: &mut DataSet, ctl: &mut ProgressController) -> Result<Outcome> {
        if !ctl.set_num_steps(self.count(T::KIND)?) {
            return Ok(Outcome::Cancelled);
        }

        let mut statement = self.conn.prepare(&select_sql(T::KIND))?;
        let mut rows = statement.query([])?;
        let mut done = 0;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let values = T::KIND
                .columns()
                .iter()
                .enumerate()
                .map(|(offset, column)| read_field(row, offset + 1, column))
                .collect::<Result<Vec<_>>>()?;
            let entity = T::from_row(&values).map_err(|err| {
                LedgerError::persistence_with(format!("{} row {id}", T::KIND.table_name()), err)
            })?;
            T::list_mut(data).push_loaded(id, entity)?;

            done += 1;
            if !ctl.set_steps_done(done) {
                return Ok(Outcome::Cancelled);
            }
        }
        Ok(Outcome::Completed(()))
    }

    fn begin(&mut self) -> Result<()> {
        if !self.in_batch {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_batch = true;
        }
        Ok(())
    }

    fn statement_for(&self, kind: EntityKind, phase: Phase) -> Result<String> {
        match &self.prepared {
            Some((prepared_kind, prepared_phase, sql))
                if *prepared_kind == kind && *prepared_phase == phase =>
            {
                Ok(sql.clone())
            }
            _ => Err(LedgerError::persistence(format!(
                "{phase} {kind} was not prepared"
            ))),
        }
    }

    fn expect_one_row(kind: EntityKind, id: i64, changed: usize) -> Result<()> {
        if changed == 1 {
            Ok(())
        } else {
            Err(LedgerError::persistence(format!(
                "no {} row with id {id}",
                kind.table_name()
            )))
        }
    }
}

fn read_field(row: &Row<'_>, index: usize, column: &Column) -> Result<FieldValue> {
    Ok(match column.ty {
        ColumnType::Integer => FieldValue::Integer(row.get(index)?),
        ColumnType::Bool => FieldValue::Bool(row.get(index)?),
        ty => {
            let text: String = row.get(index)?;
            FieldValue::parse(ty, &text).map_err(|err| {
                LedgerError::persistence_with(format!("column {}", column.name), err)
            })?
        }
    })
}

impl Backend for Database {
    fn prepare(&mut self, kind: EntityKind, phase: Phase) -> Result<()> {
        let sql = statement_sql(kind, phase);
        self.conn.prepare_cached(&sql)?;
        self.prepared = Some((kind, phase, sql));
        Ok(())
    }

    fn insert(&mut self, kind: EntityKind, id: Option<i64>, row: &[FieldValue]) -> Result<i64> {
        let sql = self.statement_for(kind, Phase::Insert)?;
        self.begin()?;
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(row.len() + 1);
        params.push(&id);
        params.extend(row.iter().map(|value| value as &dyn ToSql));
        let mut statement = self.conn.prepare_cached(&sql)?;
        statement.execute(params.as_slice())?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update(&mut self, kind: EntityKind, id: i64, row: &[FieldValue]) -> Result<()> {
        let sql = self.statement_for(kind, Phase::Update)?;
        self.begin()?;
        let mut params: Vec<&dyn ToSql> = row.iter().map(|value| value as &dyn ToSql).collect();
        params.push(&id);
        let mut statement = self.conn.prepare_cached(&sql)?;
        let changed = statement.execute(params.as_slice())?;
        Self::expect_one_row(kind, id, changed)
    }

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<()> {
        let sql = self.statement_for(kind, Phase::Delete)?;
        self.begin()?;
        let mut statement = self.conn.prepare_cached(&sql)?;
        let changed = statement.execute([id])?;
        Self::expect_one_row(kind, id, changed)
    }

    fn commit(&mut self) -> Result<()> {
        if self.in_batch {
            self.conn.execute_batch("COMMIT")?;
            self.in_batch = false;
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.in_batch {
            self.in_batch = false;
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}
