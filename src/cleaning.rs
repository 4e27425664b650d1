use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, info};

use crate::dataset::{Cell, Dataset, Row};
use crate::error::Result;

pub const PRICE_COLUMN: &str = "price";
pub const LAST_REVIEW_COLUMN: &str = "last_review";

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

/// Inclusive price bounds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Classify a raw `price` cell; `Ok` means the row is kept.
    pub fn check(&self, cell: Option<&Cell>) -> std::result::Result<f64, DropReason> {
        let raw = match cell {
            Some(Cell::Text(s)) if !s.trim().is_empty() => s.trim(),
            _ => return Err(DropReason::MissingPrice),
        };
        let price: f64 = raw.parse().map_err(|_| DropReason::NonNumericPrice)?;
        if price.is_nan() {
            Err(DropReason::MissingPrice)
        } else if price < self.min {
            Err(DropReason::BelowMin)
        } else if price > self.max {
            Err(DropReason::AboveMax)
        } else {
            Ok(price)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    MissingPrice,
    NonNumericPrice,
    BelowMin,
    AboveMax,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::MissingPrice => "missing_price",
            DropReason::NonNumericPrice => "non_numeric_price",
            DropReason::BelowMin => "below_min",
            DropReason::AboveMax => "above_max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOutcome {
    Parsed,
    Missing,
    Nulled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    Kept { date: DateOutcome },
    Dropped { reason: DropReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowVerdict {
    /// Zero-based position in the input dataset
    pub row: usize,
    pub outcome: RowOutcome,
}

/// Per-row account of what the cleaning step did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleaningReport {
    pub input_rows: usize,
    pub kept_rows: usize,
    pub verdicts: Vec<RowVerdict>,
}

impl CleaningReport {
    pub fn dropped(&self) -> impl Iterator<Item = (usize, DropReason)> + '_ {
        self.verdicts.iter().filter_map(|v| match v.outcome {
            RowOutcome::Dropped { reason } => Some((v.row, reason)),
            _ => None,
        })
    }

    pub fn dropped_rows(&self) -> usize {
        self.input_rows - self.kept_rows
    }

    pub fn count_dropped(&self, reason: DropReason) -> usize {
        self.dropped().filter(|(_, r)| *r == reason).count()
    }

    pub fn count_dates(&self, date: DateOutcome) -> usize {
        self.verdicts
            .iter()
            .filter(|v| matches!(v.outcome, RowOutcome::Kept { date: d } if d == date))
            .count()
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "input_rows": self.input_rows,
            "kept_rows": self.kept_rows,
            "dropped_rows": self.dropped_rows(),
            "dropped_missing_price": self.count_dropped(DropReason::MissingPrice),
            "dropped_non_numeric_price": self.count_dropped(DropReason::NonNumericPrice),
            "dropped_below_min": self.count_dropped(DropReason::BelowMin),
            "dropped_above_max": self.count_dropped(DropReason::AboveMax),
            "last_review_parsed": self.count_dates(DateOutcome::Parsed),
            "last_review_missing": self.count_dates(DateOutcome::Missing),
            "last_review_nulled": self.count_dates(DateOutcome::Nulled),
        })
    }
}

/// Parse a `last_review` value. Accepts ISO dates and datetimes, RFC 3339,
/// slash-separated dates (`YYYY/MM/DD`, `MM/DD/YYYY`).
pub fn parse_review_date(raw: &str) -> Option<NaiveDateTime> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn coerce_date(cell: &mut Cell) -> DateOutcome {
    let parsed = match cell {
        Cell::Null => return DateOutcome::Missing,
        Cell::Date(_) => return DateOutcome::Parsed,
        Cell::Text(raw) => parse_review_date(raw),
    };
    match parsed {
        Some(dt) => {
            *cell = Cell::Date(dt);
            DateOutcome::Parsed
        }
        None => {
            *cell = Cell::Null;
            DateOutcome::Nulled
        }
    }
}

/// Drop rows whose price falls outside `range` and coerce `last_review` on the
/// rows that remain. Row order is preserved.
pub fn clean(dataset: Dataset, range: PriceRange) -> Result<(Dataset, CleaningReport)> {
    let price_idx = dataset.require_column(PRICE_COLUMN)?;
    let review_idx = dataset.require_column(LAST_REVIEW_COLUMN)?;

    let Dataset { columns, rows } = dataset;
    let mut report = CleaningReport {
        input_rows: rows.len(),
        ..Default::default()
    };
    let mut kept: Vec<Row> = Vec::with_capacity(rows.len());

    for (i, mut row) in rows.into_iter().enumerate() {
        let outcome = match range.check(row.cells.get(price_idx)) {
            Ok(_) => {
                let date = row
                    .cells
                    .get_mut(review_idx)
                    .map(coerce_date)
                    .unwrap_or(DateOutcome::Missing);
                kept.push(row);
                RowOutcome::Kept { date }
            }
            Err(reason) => {
                debug!(row = i, reason = reason.as_str(), "Dropping row");
                RowOutcome::Dropped { reason }
            }
        };
        report.verdicts.push(RowVerdict { row: i, outcome });
    }

    report.kept_rows = kept.len();
    info!(
        input_rows = report.input_rows,
        kept_rows = report.kept_rows,
        nulled_dates = report.count_dates(DateOutcome::Nulled),
        "Basic cleanup applied"
    );

    Ok((Dataset { columns, rows: kept }, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CleaningError;

    fn dataset(csv: &str) -> Dataset {
        Dataset::read_csv(csv.as_bytes()).unwrap()
    }

    fn prices(dataset: &Dataset) -> Vec<f64> {
        (0..dataset.len())
            .map(|i| {
                dataset
                    .cell(i, PRICE_COLUMN)
                    .and_then(Cell::as_text)
                    .unwrap()
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_boundaries_are_inclusive() {
        let input = dataset("price,last_review\n49,\n50,\n999,\n1000,\n");
        let (out, report) = clean(input, PriceRange::new(50.0, 999.0)).unwrap();

        assert_eq!(prices(&out), vec![50.0, 999.0]);
        assert_eq!(report.count_dropped(DropReason::BelowMin), 1);
        assert_eq!(report.count_dropped(DropReason::AboveMax), 1);
    }

    #[test]
    fn test_all_output_prices_within_range() {
        let input = dataset(
            "id,price,last_review\n1,10,\n2,75.5,\n3,350,\n4,351,\n5,-3,\n6,200,\n",
        );
        let range = PriceRange::new(10.0, 350.0);
        let (out, report) = clean(input, range).unwrap();

        assert!(out.len() <= report.input_rows);
        for p in prices(&out) {
            assert!(range.min <= p && p <= range.max);
        }
        assert_eq!(out.len(), 4);
        assert_eq!(report.dropped_rows(), 2);
    }

    #[test]
    fn test_missing_and_non_numeric_price_are_dropped() {
        let input = dataset("price,last_review\n,2019-01-01\nfree,2019-01-01\nNaN,\n100,\n");
        let (out, report) = clean(input, PriceRange::new(0.0, 1000.0)).unwrap();

        assert_eq!(out.len(), 1);
        let dropped: Vec<_> = report.dropped().collect();
        assert_eq!(
            dropped,
            vec![
                (0, DropReason::MissingPrice),
                (1, DropReason::NonNumericPrice),
                (2, DropReason::MissingPrice),
            ]
        );
    }

    #[test]
    fn test_last_review_coercion() {
        let input = dataset(
            "price,last_review\n100,2019-05-21\n100,05/21/2019\n100,not a date\n100,\n",
        );
        let (out, report) = clean(input, PriceRange::new(0.0, 1000.0)).unwrap();

        let expected = NaiveDate::from_ymd_opt(2019, 5, 21)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(out.cell(0, LAST_REVIEW_COLUMN), Some(&Cell::Date(expected)));
        assert_eq!(out.cell(1, LAST_REVIEW_COLUMN), Some(&Cell::Date(expected)));
        assert_eq!(out.cell(2, LAST_REVIEW_COLUMN), Some(&Cell::Null));
        assert_eq!(out.cell(3, LAST_REVIEW_COLUMN), Some(&Cell::Null));

        assert_eq!(report.count_dates(DateOutcome::Parsed), 2);
        assert_eq!(report.count_dates(DateOutcome::Nulled), 1);
        assert_eq!(report.count_dates(DateOutcome::Missing), 1);
    }

    #[test]
    fn test_other_columns_untouched() {
        let input = dataset("id,name,price,last_review\n7,\"Loft, Brooklyn\",120.00,2020-01-01\n");
        let (out, _) = clean(input, PriceRange::new(100.0, 200.0)).unwrap();

        assert_eq!(out.cell(0, "id"), Some(&Cell::Text("7".to_string())));
        assert_eq!(
            out.cell(0, "name"),
            Some(&Cell::Text("Loft, Brooklyn".to_string()))
        );
        assert_eq!(out.cell(0, PRICE_COLUMN), Some(&Cell::Text("120.00".to_string())));
    }

    #[test]
    fn test_missing_column_is_parse_error() {
        let input = dataset("price,name\n100,x\n");
        let err = clean(input, PriceRange::new(0.0, 1000.0)).unwrap_err();
        assert!(matches!(err, CleaningError::Parse(_)));
    }

    #[test]
    fn test_parse_review_date_formats() {
        let d = |y, m, day, h, min, s| {
            NaiveDate::from_ymd_opt(y, m, day)
                .unwrap()
                .and_hms_opt(h, min, s)
                .unwrap()
        };
        assert_eq!(parse_review_date("2019-01-01"), Some(d(2019, 1, 1, 0, 0, 0)));
        assert_eq!(parse_review_date(" 2019/01/02 "), Some(d(2019, 1, 2, 0, 0, 0)));
        assert_eq!(
            parse_review_date("2019-01-01 13:45:00"),
            Some(d(2019, 1, 1, 13, 45, 0))
        );
        assert_eq!(
            parse_review_date("2019-01-01T13:45:00"),
            Some(d(2019, 1, 1, 13, 45, 0))
        );
        assert_eq!(
            parse_review_date("2019-01-01T13:45:00+02:00"),
            Some(d(2019, 1, 1, 11, 45, 0))
        );
        assert_eq!(parse_review_date("2019-02-30"), None);
        assert_eq!(parse_review_date("bad"), None);
        assert_eq!(parse_review_date(""), None);
    }

    #[test]
    fn test_report_summary() {
        let input = dataset("price,last_review\n10,2019-01-01\n500,bad\n1000,2020-01-01\n");
        let (_, report) = clean(input, PriceRange::new(50.0, 999.0)).unwrap();
        let summary = report.summary();

        assert_eq!(summary["input_rows"], 3);
        assert_eq!(summary["kept_rows"], 1);
        assert_eq!(summary["dropped_below_min"], 1);
        assert_eq!(summary["dropped_above_max"], 1);
        assert_eq!(summary["last_review_nulled"], 1);
    }
}
