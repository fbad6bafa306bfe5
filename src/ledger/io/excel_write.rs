use std::collections::BTreeMap;
use std::path::Path;

use rust_xlsxwriter::{Format, Workbook, Worksheet};
use tracing::{debug, instrument};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::model::{EntityKind, FieldValue, ID_COLUMN};
use crate::ledger::sync::{Backend, Phase};

/// Sheet name storing the format version and per-sheet row counts.
pub const METADATA_SHEET: &str = "Metadata";
/// Layout version written into the metadata sheet.
pub const FORMAT_VERSION: &str = "1";
/// Metadata key holding [`FORMAT_VERSION`].
pub const VERSION_KEY: &str = "format_version";

/// One stored row: the id followed by values at fixed column offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub id: i64,
    pub values: Vec<FieldValue>,
}

#[derive(Debug)]
enum JournalEntry {
    Inserted { kind: EntityKind, id: i64 },
    Updated { kind: EntityKind, index: usize, previous: SheetRow },
    Deleted { kind: EntityKind, index: usize, row: SheetRow },
}

/// In-memory workbook accepting batched row writes, saved as xlsx.
///
/// Each entity kind owns one sheet. Writes since the last commit are
/// journalled so the active batch can be rolled back.
#[derive(Debug, Default)]
pub struct SheetBackend {
    sheets: BTreeMap<EntityKind, Vec<SheetRow>>,
    journal: Vec<JournalEntry>,
    prepared: Option<(EntityKind, Phase)>,
    commits: usize,
}

impl SheetBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, kind: EntityKind) -> &[SheetRow] {
        self.sheets.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    fn sheet_mut(&mut self, kind: EntityKind) -> &mut Vec<SheetRow> {
        self.sheets.entry(kind).or_default()
    }

    fn position(&self, kind: EntityKind, id: i64) -> Option<usize> {
        self.rows(kind).iter().position(|row| row.id == id)
    }

    fn check_prepared(&self, kind: EntityKind, phase: Phase) -> Result<()> {
        if self.prepared == Some((kind, phase)) {
            Ok(())
        } else {
            Err(LedgerError::excel(format!(
                "{phase} {kind} was not prepared on the workbook"
            )))
        }
    }

    fn check_layout(kind: EntityKind, row: &[FieldValue]) -> Result<()> {
        let columns = kind.columns();
        let matches = row.len() == columns.len()
            && row
                .iter()
                .zip(columns)
                .all(|(value, column)| value.column_type() == column.ty);
        if matches {
            Ok(())
        } else {
            Err(LedgerError::excel(format!(
                "row does not match the {} sheet layout",
                kind.sheet_name()
            )))
        }
    }

    /// Writes the committed sheets to an xlsx file.
    #[instrument(level = "debug", skip(self), fields(output = %path.display()))]
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut workbook = Workbook::new();
        let header = Format::new().set_bold();

        for kind in EntityKind::INSERT_ORDER {
            let worksheet = workbook.add_worksheet();
            worksheet.set_name(kind.sheet_name())?;
            write_sheet(worksheet, kind, self.rows(kind), &header)?;
        }

        let metadata = workbook.add_worksheet();
        metadata.set_name(METADATA_SHEET)?;
        metadata.write_string_with_format(0, 0, "key", &header)?;
        metadata.write_string_with_format(0, 1, "value", &header)?;
        metadata.write_string(1, 0, VERSION_KEY)?;
        metadata.write_string(1, 1, FORMAT_VERSION)?;
        for (offset, kind) in EntityKind::INSERT_ORDER.into_iter().enumerate() {
            let row = (offset + 2) as u32;
            metadata.write_string(row, 0, kind.sheet_name())?;
            metadata.write_number(row, 1, self.rows(kind).len() as f64)?;
        }

        workbook.save(path).map_err(|err| {
            LedgerError::excel_with(format!("cannot save workbook {}", path.display()), err)
        })?;
        debug!(commits = self.commits, "workbook saved");
        Ok(())
    }
}

fn write_sheet(
    worksheet: &mut Worksheet,
    kind: EntityKind,
    rows: &[SheetRow],
    header: &Format,
) -> Result<()> {
    worksheet.write_string_with_format(0, 0, ID_COLUMN, header)?;
    for (offset, column) in kind.columns().iter().enumerate() {
        worksheet.write_string_with_format(0, (offset + 1) as u16, column.name, header)?;
    }
    worksheet.set_freeze_panes(1, 0)?;

    for (row_idx, row) in rows.iter().enumerate() {
        let excel_row = (row_idx + 1) as u32;
        worksheet.write_number(excel_row, 0, row.id as f64)?;
        for (offset, value) in row.values.iter().enumerate() {
            let col = (offset + 1) as u16;
            match value {
                FieldValue::Integer(number) => {
                    worksheet.write_number(excel_row, col, *number as f64)?;
                }
                FieldValue::Bool(flag) => {
                    worksheet.write_boolean(excel_row, col, *flag)?;
                }
                // Text, decimals and dates are stored as strings so they read
                // back exactly.
                other => {
                    worksheet.write_string(excel_row, col, other.to_string())?;
                }
            }
        }
    }
    Ok(())
}

impl Backend for SheetBackend {
    fn prepare(&mut self, kind: EntityKind, phase: Phase) -> Result<()> {
        self.prepared = Some((kind, phase));
        self.sheet_mut(kind);
        Ok(())
    }

    fn insert(&mut self, kind: EntityKind, id: Option<i64>, row: &[FieldValue]) -> Result<i64> {
        self.check_prepared(kind, Phase::Insert)?;
        Self::check_layout(kind, row)?;
        let id = match id {
            Some(id) if self.position(kind, id).is_some() => {
                return Err(LedgerError::excel(format!(
                    "duplicate id {id} in sheet {}",
                    kind.sheet_name()
                )));
            }
            Some(id) => id,
            None => self.rows(kind).iter().map(|row| row.id).max().unwrap_or(0) + 1,
        };
        self.sheet_mut(kind).push(SheetRow {
            id,
            values: row.to_vec(),
        });
        self.journal.push(JournalEntry::Inserted { kind, id });
        Ok(id)
    }

    fn update(&mut self, kind: EntityKind, id: i64, row: &[FieldValue]) -> Result<()> {
        self.check_prepared(kind, Phase::Update)?;
        Self::check_layout(kind, row)?;
        let index = self.position(kind, id).ok_or_else(|| {
            LedgerError::excel(format!("no row with id {id} in sheet {}", kind.sheet_name()))
        })?;
        let slot = &mut self.sheet_mut(kind)[index];
        let previous = std::mem::replace(
            slot,
            SheetRow {
                id,
                values: row.to_vec(),
            },
        );
        self.journal.push(JournalEntry::Updated {
            kind,
            index,
            previous,
        });
        Ok(())
    }

    fn delete(&mut self, kind: EntityKind, id: i64) -> Result<()> {
        self.check_prepared(kind, Phase::Delete)?;
        let index = self.position(kind, id).ok_or_else(|| {
            LedgerError::excel(format!("no row with id {id} in sheet {}", kind.sheet_name()))
        })?;
        let row = self.sheet_mut(kind).remove(index);
        self.journal.push(JournalEntry::Deleted { kind, index, row });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.journal.clear();
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        while let Some(entry) = self.journal.pop() {
            match entry {
                JournalEntry::Inserted { kind, id } => {
                    if let Some(index) = self.position(kind, id) {
                        self.sheet_mut(kind).remove(index);
                    }
                }
                JournalEntry::Updated {
                    kind,
                    index,
                    previous,
                } => {
                    self.sheet_mut(kind)[index] = previous;
                }
                JournalEntry::Deleted { kind, index, row } => {
                    self.sheet_mut(kind).insert(index, row);
                }
            }
        }
        Ok(())
    }
}
