//! Candidate rows as emitted by a record source: flat JSON objects keyed by
//! column name.

use serde_json::Value;
use std::{borrow::Cow, collections::BTreeMap};

pub type Record = BTreeMap<String, Value>;

/// Grouping key for one cell. Absent fields and explicit nulls collapse to
/// the same key; the type tag keeps `"1"` and `1` apart.
pub(crate) fn cell_key(record: &Record, column: &str) -> String {
    match record.get(column) {
        None | Some(Value::Null) => "null".to_owned(),
        Some(Value::String(text)) => format!("s:{text}"),
        Some(Value::Number(number)) => format!("n:{number}"),
        Some(Value::Bool(flag)) => format!("b:{flag}"),
        Some(other) => format!("j:{other}"),
    }
}

/// Textual view of a field for pattern and value-set rules. `None` when the
/// field is absent or null.
pub(crate) fn field_text<'a>(record: &'a Record, field: &str) -> Option<Cow<'a, str>> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(text) => Some(Cow::Borrowed(text.as_str())),
        Value::Number(number) => Some(Cow::Owned(number.to_string())),
        Value::Bool(flag) => Some(Cow::Owned(flag.to_string())),
        other => Some(Cow::Owned(other.to_string())),
    }
}

pub(crate) fn is_present(record: &Record, field: &str) -> bool {
    !matches!(record.get(field), None | Some(Value::Null))
}
