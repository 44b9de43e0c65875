//! Catalog records: a stable id, a creation timestamp and free-form scalar fields.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A scalar field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric value (JSON number)
    Number(f64),
    /// Text value
    Text(String),
}

impl FieldValue {
    /// Text form used for search, normalization and export.
    /// Whole numbers render without a fractional part.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            FieldValue::Number(n) => n.to_string(),
        }
    }

    /// True for empty or whitespace-only text
    pub fn is_blank(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n as f64)
    }
}

/// A single catalog entry (book, member, ...).
///
/// Serialized flat: `{"id": .., "createdAt": .., "title": .., ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique identifier
    pub id: String,
    /// When the record was first created
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Domain fields (title, author, series, category, ...)
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// New record with a random id, created now
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string(), Utc::now())
    }

    /// New record with an explicit id and timestamp
    pub fn with_id(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Field value by name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Field text by name, empty when absent
    pub fn text(&self, name: &str) -> String {
        self.fields.get(name).map(FieldValue::as_text).unwrap_or_default()
    }

    /// Case-insensitive substring match against every field and the id
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.id.to_lowercase().contains(&needle)
            || self
                .fields
                .values()
                .any(|v| v.as_text().to_lowercase().contains(&needle))
    }
}

impl Default for Record {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn serializes_flat() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let r = Record::with_id("b1", ts)
            .field("title", "Dune")
            .field("volume", 2i64);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["id"], "b1");
        assert_eq!(json["title"], "Dune");
        assert_eq!(json["volume"], 2.0);
        assert_eq!(json["createdAt"], "2024-03-01T12:00:00Z");

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn number_text_form() {
        assert_eq!(FieldValue::Number(3.0).as_text(), "3");
        assert_eq!(FieldValue::Number(2.5).as_text(), "2.5");
        assert_eq!(FieldValue::from("x").as_text(), "x");
    }

    #[test]
    fn matches_is_case_insensitive() {
        let r = Record::new().field("title", "The Hobbit").field("author", "Tolkien");
        assert!(r.matches("hobbit"));
        assert!(r.matches("TOLK"));
        assert!(!r.matches("rowling"));
        assert!(r.matches("   "));
    }

    #[test]
    fn text_of_missing_field_is_empty() {
        let r = Record::new();
        assert_eq!(r.text("title"), "");
        assert!(FieldValue::from("  ").is_blank());
    }
}
