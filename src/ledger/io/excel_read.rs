use std::collections::HashMap;
use std::path::{Path, PathBuf};

use calamine::{DataType, Reader, Xlsx, XlsxError, open_workbook};
use tracing::{info, instrument};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::io::excel_write::{FORMAT_VERSION, METADATA_SHEET, VERSION_KEY};
use crate::ledger::model::{
    Account, ColumnType, DataSet, Entity, EntityKind, FieldValue, ID_COLUMN, RowError, TaxYear,
    Transaction,
};
use crate::ledger::progress::{Outcome, ProgressController};

/// Loads a data set from a workbook produced by
/// [`SheetBackend::save`](crate::ledger::io::excel_write::SheetBackend::save).
#[derive(Debug, Clone)]
pub struct SheetReader {
    path: PathBuf,
}

impl SheetReader {
    /// One stage per entity sheet.
    pub const STAGE_COUNT: usize = EntityKind::INSERT_ORDER.len();

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(level = "info", skip_all, fields(input = %self.path.display()))]
    pub fn load(&self, ctl: &mut ProgressController) -> Result<Outcome<DataSet>> {
        let mut workbook: Xlsx<_> = open_workbook(&self.path).map_err(|err: XlsxError| {
            LedgerError::excel_with(format!("cannot open workbook {}", self.path.display()), err)
        })?;

        let metadata = read_required_sheet(&mut workbook, METADATA_SHEET)?;
        let row_counts = parse_metadata(&metadata)?;

        let mut data = DataSet::new();
        for kind in EntityKind::INSERT_ORDER {
            if !ctl.set_new_stage(format!("Loading {kind}")) {
                return Ok(Outcome::Cancelled);
            }
            let range = read_required_sheet(&mut workbook, kind.sheet_name())?;
            let outcome = match kind {
                EntityKind::TaxYear => ingest_sheet::<TaxYear>(&range, &mut data, ctl)?,
                EntityKind::Account => ingest_sheet::<Account>(&range, &mut data, ctl)?,
                EntityKind::Transaction => ingest_sheet::<Transaction>(&range, &mut data, ctl)?,
            };
            if outcome.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let expected = row_counts.get(kind.sheet_name()).copied();
            if expected != Some(data.count(kind)) {
                return Err(LedgerError::excel(format!(
                    "sheet {} holds {} rows, metadata records {expected:?}",
                    kind.sheet_name(),
                    data.count(kind)
                )));
            }
        }

        info!(items = data.total_items(), "read data set from workbook");
        Ok(Outcome::Completed(data))
    }
}

fn read_required_sheet<R: std::io::Read + std::io::Seek>(
    workbook: &mut Xlsx<R>,
    name: &str,
) -> Result<calamine::Range<DataType>> {
    let range_result = workbook
        .worksheet_range(name)
        .ok_or_else(|| LedgerError::excel(format!("missing sheet '{name}'")))?;
    let range = range_result.map_err(LedgerError::from)?;
    Ok(range)
}

fn parse_metadata(range: &calamine::Range<DataType>) -> Result<HashMap<String, usize>> {
    let mut version = None;
    let mut row_counts = HashMap::new();

    for row in range.rows().skip(1) {
        let key = cell_to_string(row.first());
        if key.is_empty() {
            continue;
        }
        let value = cell_to_string(row.get(1));
        if key == VERSION_KEY {
            version = Some(value);
            continue;
        }
        let count = value.parse::<usize>().map_err(|_| {
            LedgerError::excel(format!("invalid row count '{value}' for sheet '{key}'"))
        })?;
        row_counts.insert(key, count);
    }

    match version.as_deref() {
        Some(FORMAT_VERSION) => Ok(row_counts),
        Some(other) => Err(LedgerError::excel(format!(
            "unsupported workbook format version '{other}'"
        ))),
        None => Err(LedgerError::excel("workbook metadata has no format version")),
    }
}

fn check_headers(range: &calamine::Range<DataType>, kind: EntityKind) -> Result<()> {
    let headers: Vec<String> = match range.rows().next() {
        Some(first_row) => first_row
            .iter()
            .map(|cell| cell_to_string(Some(cell)))
            .collect(),
        None => Vec::new(),
    };
    let expected: Vec<&str> = std::iter::once(ID_COLUMN)
        .chain(kind.columns().iter().map(|column| column.name))
        .collect();

    if headers.len() < expected.len() || headers.iter().zip(&expected).any(|(h, e)| h != e) {
        return Err(LedgerError::excel(format!(
            "sheet {} has headers {headers:?}, expected {expected:?}",
            kind.sheet_name()
        )));
    }
    Ok(())
}

fn ingest_sheet<T: Entity>(
    range: &calamine::Range<DataType>,
    data: &mut DataSet,
    ctl: &mut ProgressController,
) -> Result<Outcome> {
    let sheet = T::KIND.sheet_name();
    check_headers(range, T::KIND)?;

    let rows: Vec<(usize, &[DataType])> = range
        .rows()
        .enumerate()
        .skip(1)
        .filter(|(_, row)| !cell_to_string(row.first()).is_empty())
        .collect();
    if !ctl.set_num_steps(rows.len()) {
        return Ok(Outcome::Cancelled);
    }

    for (done, (row_idx, row)) in rows.into_iter().enumerate() {
        let excel_row = row_idx + 1;
        let raw_id = cell_to_string(row.first());
        let id = raw_id.parse::<i64>().map_err(|_| {
            LedgerError::excel(format!("{sheet} row {excel_row}: invalid id '{raw_id}'"))
        })?;

        let values = T::KIND
            .columns()
            .iter()
            .enumerate()
            .map(|(offset, column)| cell_to_field(row.get(offset + 1), column.ty))
            .collect::<std::result::Result<Vec<_>, RowError>>()
            .and_then(|values| T::from_row(&values))
            .map_err(|err| LedgerError::excel_with(format!("{sheet} row {excel_row}"), err))?;

        T::list_mut(data).push_loaded(id, values).map_err(|_| {
            LedgerError::excel(format!("{sheet} row {excel_row}: duplicate id {id}"))
        })?;

        if !ctl.set_steps_done(done + 1) {
            return Ok(Outcome::Cancelled);
        }
    }
    Ok(Outcome::Completed(()))
}

fn cell_to_field(cell: Option<&DataType>, ty: ColumnType) -> std::result::Result<FieldValue, RowError> {
    match (ty, cell) {
        (ColumnType::Text, None | Some(DataType::Empty)) => Ok(FieldValue::Text(String::new())),
        (_, None | Some(DataType::Empty)) => Err(RowError::InvalidValue {
            value: String::new(),
            ty,
        }),
        (ColumnType::Bool, Some(DataType::Bool(flag))) => Ok(FieldValue::Bool(*flag)),
        (ColumnType::Integer, Some(DataType::Int(number))) => Ok(FieldValue::Integer(*number)),
        (ColumnType::Integer, Some(DataType::Float(number))) if number.fract() == 0.0 => {
            Ok(FieldValue::Integer(*number as i64))
        }
        (ty, cell) => FieldValue::parse(ty, &cell_to_string(cell)),
    }
}

fn cell_to_string(cell: Option<&DataType>) -> String {
    match cell {
        Some(DataType::String(value)) => value.clone(),
        Some(DataType::Float(value)) => value.to_string(),
        Some(DataType::Int(value)) => value.to_string(),
        Some(DataType::Bool(value)) => value.to_string(),
        Some(DataType::Empty) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
