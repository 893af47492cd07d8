//! CSV export parsing
//!
//! The header row names the fields. Every cell becomes a JSON string; blank
//! cells are left out of the record so that the normalizer treats them as
//! missing. Column types are guessed from a sample of rows, but the guess is
//! only used for repeat groups the registry does not declare.

use formsync_common::types::parse_date;
use formsync_common::{RawRecord, ScalarType};
use serde_json::Value;

use crate::error::FetchCause;

/// Rows sampled per column when guessing types
pub const DEFAULT_SAMPLE_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: ScalarType,
}

#[derive(Debug, Clone, Default)]
pub struct TabularPayload {
    pub columns: Vec<InferredColumn>,
    pub records: Vec<RawRecord>,
}

/// Parse a CSV body with a header row
pub fn parse_csv(body: &[u8], sample_size: usize) -> Result<TabularPayload, FetchCause> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(body);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().any(|h| h.is_empty()) {
        return Err(FetchCause::Payload("CSV header contains an empty column name".to_string()));
    }

    let mut records = Vec::new();
    let mut samples: Vec<Vec<String>> = vec![Vec::new(); headers.len()];

    for row in reader.records() {
        let row = row?;
        let mut record = RawRecord::new();

        for (column, cell) in row.iter().enumerate() {
            let Some(name) = headers.get(column) else {
                continue;
            };
            if cell.trim().is_empty() {
                continue;
            }
            if records.len() < sample_size {
                samples[column].push(cell.trim().to_string());
            }
            record.insert(name.clone(), Value::String(cell.to_string()));
        }

        records.push(record);
    }

    let columns = headers
        .into_iter()
        .zip(samples)
        .map(|(name, sample)| InferredColumn {
            data_type: infer_column_type(sample.iter().map(String::as_str)),
            name,
        })
        .collect();

    Ok(TabularPayload { columns, records })
}

/// Narrowest type every sample parses as: int, float, bool, date, then string
pub fn infer_column_type<'a>(samples: impl IntoIterator<Item = &'a str>) -> ScalarType {
    let samples: Vec<&str> = samples.into_iter().filter(|s| !s.trim().is_empty()).collect();
    if samples.is_empty() {
        return ScalarType::String;
    }

    let all = |pred: &dyn Fn(&str) -> bool| samples.iter().all(|s| pred(s.trim()));

    if all(&|s| s.parse::<i64>().is_ok()) {
        ScalarType::Int
    } else if all(&|s| s.parse::<f64>().map(f64::is_finite).unwrap_or(false)) {
        ScalarType::Float
    } else if all(&|s| matches!(s.to_lowercase().as_str(), "true" | "false")) {
        ScalarType::Bool
    } else if all(&|s| parse_date(s).is_some()) {
        ScalarType::Date
    } else {
        ScalarType::String
    }
}
