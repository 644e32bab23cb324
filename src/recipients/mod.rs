//! Recipient data.
//!
//! Recipients come from a table with named columns. `Company Name` and
//! `Email` are required; every column doubles as a `{Column}` placeholder
//! in the message template.

use serde::Serialize;
use std::io;
use std::iter;
use std::path::Path;

use crate::errors::{CampaignError, CampaignResult};

/// Column holding the recipient address.
pub const EMAIL_COLUMN: &str = "Email";

/// Column holding the company name.
pub const COMPANY_COLUMN: &str = "Company Name";

/// Columns every recipient table must have.
pub const REQUIRED_COLUMNS: [&str; 2] = [COMPANY_COLUMN, EMAIL_COLUMN];

/// One recipient row. Fields keep the table's column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecipientRecord {
    fields: Vec<(String, String)>,
}

impl RecipientRecord {
    /// Creates a record from `(column, value)` pairs.
    pub fn new<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the value of a column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the recipient address (empty if the column is absent).
    pub fn email(&self) -> &str {
        self.get(EMAIL_COLUMN).unwrap_or("").trim()
    }

    /// Returns the company name.
    pub fn company_name(&self) -> Option<&str> {
        self.get(COMPANY_COLUMN)
    }

    /// Iterates over `(column, value)` pairs in column order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Validated, ordered set of recipients.
#[derive(Debug, Clone, Default)]
pub struct RecipientTable {
    columns: Vec<String>,
    records: Vec<RecipientRecord>,
}

impl RecipientTable {
    /// Builds a table from column names and rows of cell values.
    pub fn from_rows<C, R, V>(columns: C, rows: impl IntoIterator<Item = R>) -> CampaignResult<Self>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        validate_columns(&columns)?;

        let records = rows
            .into_iter()
            .map(|row| RecipientRecord::new(fill_row(&columns, row.into_iter().map(Into::into))))
            .collect();

        Ok(Self { columns, records })
    }

    /// Reads CSV data with a header row.
    pub fn from_reader<R: io::Read>(reader: R) -> CampaignResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        validate_columns(&columns)?;

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            records.push(RecipientRecord::new(fill_row(
                &columns,
                row.iter().map(str::to_string),
            )));
        }

        tracing::debug!(rows = records.len(), columns = columns.len(), "Loaded recipients");
        Ok(Self { columns, records })
    }

    /// Reads a CSV file.
    pub fn from_path(path: impl AsRef<Path>) -> CampaignResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            CampaignError::invalid_input(format!("Cannot open {}: {}", path.display(), e))
                .with_cause(e)
        })?;
        Self::from_reader(io::BufReader::new(file))
    }

    /// Checks that the required columns are present.
    pub fn validate(&self) -> CampaignResult<()> {
        validate_columns(&self.columns)
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns one `{Column}` placeholder per column.
    pub fn placeholders(&self) -> Vec<String> {
        self.columns.iter().map(|c| format!("{{{}}}", c)).collect()
    }

    /// Returns the records in input order.
    pub fn records(&self) -> &[RecipientRecord] {
        &self.records
    }

    /// Number of recipients.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no recipients.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pairs cells with columns. Missing trailing cells are empty; extra cells
/// are dropped.
fn fill_row(columns: &[String], cells: impl IntoIterator<Item = String>) -> Vec<(String, String)> {
    columns
        .iter()
        .cloned()
        .zip(cells.into_iter().chain(iter::repeat_with(String::new)))
        .collect()
}

fn validate_columns(columns: &[String]) -> CampaignResult<()> {
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|required| !columns.iter().any(|c| c == required))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CampaignError::missing_columns(&missing))
    }
}
