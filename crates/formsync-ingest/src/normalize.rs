//! Record normalization
//!
//! Maps raw source fields to target names and typed values. Every declared
//! scalar field is present in the output: values that are missing or cannot
//! be coerced are replaced by the field's default. Unknown raw fields are
//! dropped.

use formsync_common::{FieldValue, RawRecord, ScalarType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::flatten::ParentLink;
use crate::registry::{FieldKind, FieldSpec, FormDefinition, CHILD_KEY_COLUMN, PARENT_KEY_COLUMN};

/// Target column name → typed value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct NormalizedRecord {
    values: BTreeMap<String, FieldValue>,
}

impl NormalizedRecord {
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }

    pub fn insert(&mut self, column: impl Into<String>, value: FieldValue) {
        self.values.insert(column.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Textual value of a column, `None` when absent or blank
    pub fn key_text(&self, column: &str) -> Option<String> {
        self.values
            .get(column)
            .filter(|v| !v.is_blank())
            .map(ToString::to_string)
    }
}

impl FromIterator<(String, FieldValue)> for NormalizedRecord {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Normalize one top-level submission.
///
/// Fails only when the unique key has no value in the raw record.
pub fn normalize(raw: &RawRecord, form: &FormDefinition) -> Result<NormalizedRecord, NormalizeError> {
    let missing_key = || NormalizeError::MissingKey {
        form_id: form.id.clone(),
        key: form.unique_key.clone(),
    };

    let mut record = NormalizedRecord::default();
    fill_scalars(raw, &form.fields, &mut record);

    let key_value = match form.key_field() {
        Some(field) => coerce_present(raw, field).ok_or_else(missing_key)?,
        // Undeclared key columns are read under their own name as text
        None => raw
            .get(&form.unique_key)
            .and_then(|value| ScalarType::String.coerce(value).ok().flatten())
            .ok_or_else(missing_key)?,
    };
    if key_value.is_blank() {
        return Err(missing_key());
    }
    record.insert(form.unique_key.clone(), key_value);

    Ok(record)
}

/// Normalize one repeat-group row against the group's child fields
pub fn normalize_child(link: &ParentLink, fields: &[FieldSpec]) -> NormalizedRecord {
    let mut record = NormalizedRecord::default();
    fill_scalars(&link.record, fields, &mut record);
    record.insert(CHILD_KEY_COLUMN, FieldValue::String(link.key.clone()));
    record.insert(PARENT_KEY_COLUMN, FieldValue::String(link.parent_key.clone()));
    record
}

fn fill_scalars(raw: &RawRecord, fields: &[FieldSpec], record: &mut NormalizedRecord) {
    for field in fields {
        let FieldKind::Scalar { default_value, .. } = &field.kind else {
            continue;
        };
        let value = coerce_present(raw, field).unwrap_or_else(|| default_value.clone());
        record.insert(field.target_name.clone(), value);
    }
}

/// Coerced value of a scalar field, `None` when missing, blank or uncoercible
fn coerce_present(raw: &RawRecord, field: &FieldSpec) -> Option<FieldValue> {
    let FieldKind::Scalar { data_type, .. } = &field.kind else {
        return None;
    };
    let value = raw.get(&field.source_name)?;

    match data_type.coerce(value) {
        Ok(coerced) => coerced,
        Err(e) => {
            debug!(field = %field.source_name, error = %e, "Value not coercible, using default");
            None
        },
    }
}

/// Normalized submissions of one batch plus what was dropped on the way
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<NormalizedRecord>,
    /// Index into the input of the raw record each output record came from
    pub sources: Vec<usize>,
    pub missing_key: usize,
    pub duplicates: usize,
}

/// Normalize a batch of submissions, collapsing duplicate keys (last wins)
pub fn normalize_batch(raws: &[RawRecord], form: &FormDefinition) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for (index, raw) in raws.iter().enumerate() {
        let record = match normalize(raw, form) {
            Ok(record) => record,
            Err(e) => {
                debug!(form_id = %form.id, error = %e, "Dropping record");
                batch.missing_key += 1;
                continue;
            },
        };

        let Some(key) = record.key_text(&form.unique_key) else {
            batch.missing_key += 1;
            continue;
        };

        match positions.get(&key) {
            Some(&position) => {
                batch.records[position] = record;
                batch.sources[position] = index;
                batch.duplicates += 1;
            },
            None => {
                positions.insert(key, batch.records.len());
                batch.records.push(record);
                batch.sources.push(index);
            },
        }
    }

    if batch.missing_key > 0 {
        warn!(form_id = %form.id, dropped = batch.missing_key, key = %form.unique_key, "Dropped records without a unique key");
    }
    if batch.duplicates > 0 {
        warn!(form_id = %form.id, duplicates = batch.duplicates, "Collapsed duplicate keys, last occurrence kept");
    }

    batch
}

/// Collapse repeat-group rows sharing a key, keeping the last occurrence
pub fn dedupe_links(links: Vec<ParentLink>) -> (Vec<ParentLink>, usize) {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<ParentLink> = Vec::with_capacity(links.len());
    let mut duplicates = 0;

    for link in links {
        match positions.get(&link.key) {
            Some(&position) => {
                unique[position] = link;
                duplicates += 1;
            },
            None => {
                positions.insert(link.key.clone(), unique.len());
                unique.push(link);
            },
        }
    }

    (unique, duplicates)
}
