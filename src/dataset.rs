//! In-memory tabular dataset with CSV load and write.
//!
//! Every field is kept as the text it was read with; only columns that a
//! cleaning step coerces change representation.

use chrono::{NaiveDateTime, NaiveTime};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{CleaningError, Result};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Date(NaiveDateTime),
    Null,
}

impl Cell {
    fn from_field(field: &str) -> Self {
        if field.is_empty() {
            Cell::Null
        } else {
            Cell::Text(field.to_string())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Cell::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Headers are stored as read; lookup ignores surrounding whitespace.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .or_else(|| self.columns.iter().position(|c| c.trim() == name.trim()))
    }

    /// Like `column_index`, but a missing column is a parse failure.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            CleaningError::Parse(format!("missing required column '{}'", name))
        })
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.cells.get(idx))
    }

    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            CleaningError::Parse(format!("cannot open '{}': {}", path.display(), e))
        })?;
        Self::read_csv(file)
    }

    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| CleaningError::Parse(format!("unreadable header row: {}", e)))?;
        let columns: Vec<String> = headers.iter().map(str::to_string).collect();
        if columns.iter().all(|c| c.trim().is_empty()) {
            return Err(CleaningError::Parse("empty header row".to_string()));
        }

        let mut dataset = Dataset::new(columns);
        for (i, record) in rdr.records().enumerate() {
            // Header is line 1
            let record = record.map_err(|e| {
                CleaningError::Parse(format!("malformed record at line {}: {}", i + 2, e))
            })?;
            let cells = record.iter().map(Cell::from_field).collect();
            dataset.rows.push(Row { cells });
        }
        Ok(dataset)
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.to_writer(file)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let date_columns = self.date_column_formats();
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            let fields: Vec<String> = row
                .cells
                .iter()
                .enumerate()
                .map(|(idx, cell)| match cell {
                    Cell::Text(s) => s.clone(),
                    Cell::Null => String::new(),
                    Cell::Date(dt) => dt.format(date_columns[idx]).to_string(),
                })
                .collect();
            wtr.write_record(&fields)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// A date column prints without a time part only when every value in it
    /// falls on midnight.
    fn date_column_formats(&self) -> Vec<&'static str> {
        (0..self.columns.len())
            .map(|idx| {
                let has_time = self.rows.iter().any(|row| {
                    matches!(row.cells.get(idx), Some(Cell::Date(dt)) if dt.time() != NaiveTime::MIN)
                });
                if has_time {
                    DATETIME_FORMAT
                } else {
                    DATE_FORMAT
                }
            })
            .collect()
    }
}
