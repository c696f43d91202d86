use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// A single long-form definition of an acronym, with any nested spelling
/// or usage variations.
///
/// Nodes are built once from a decoded Acromine record and never mutated.
/// A record missing any of the three required scalar fields does not
/// produce a node at all; it is simply absent from its parent's
/// `variations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LongForm {
    /// Expanded form of the acronym (`lf`).
    #[serde(rename = "lf")]
    pub name: String,
    /// Number of occurrences observed in the corpus (`freq`).
    #[serde(rename = "freq")]
    pub frequency: u64,
    /// Year the form was first seen (`since`).
    pub since: i64,
    /// Nested variations of this form, possibly empty (`vars`).
    #[serde(rename = "vars")]
    pub variations: Vec<LongForm>,
}

impl LongForm {
    /// Parses one record into a node, recursing into `vars`.
    ///
    /// Returns `None` when `lf`, `freq`, or `since` is absent or has the
    /// wrong type. A malformed entry inside `vars` is skipped without
    /// affecting its siblings.
    pub fn from_record(record: &Value) -> Option<LongForm> {
        let name = record.get("lf")?.as_str()?.to_string();
        let frequency = record.get("freq")?.as_u64()?;
        let since = record.get("since")?.as_i64()?;

        let variations = match record.get("vars").and_then(Value::as_array) {
            Some(vars) => vars.iter().filter_map(LongForm::from_record).collect(),
            None => Vec::new(),
        };

        Some(LongForm {
            name,
            frequency,
            since,
            variations,
        })
    }

    /// Parses a sequence of records, dropping the ones that fail.
    pub fn from_records(records: &[Value]) -> Vec<LongForm> {
        records.iter().filter_map(LongForm::from_record).collect()
    }

    /// Interprets a full Acromine lookup response.
    ///
    /// The endpoint answers with a sequence of acronym records; the first
    /// one carries the long forms for the queried acronym under `lfs`.
    /// An empty or shapeless response yields an empty list.
    pub fn from_lookup(records: &[Value]) -> Vec<LongForm> {
        records
            .first()
            .and_then(|record| record.get("lfs"))
            .and_then(Value::as_array)
            .map(|lfs| Self::from_records(lfs))
            .unwrap_or_default()
    }
}

impl fmt::Display for LongForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // lf: heavy meromyosin, freq: 267, since: 1971
        write!(
            f,
            "lf: {}, freq: {}, since: {}",
            self.name, self.frequency, self.since
        )
    }
}
