//! Bulk CSV import and export.
//!
//! Column labels are translated through a [`FieldMapping`]. Labels without an
//! explicit mapping pass through trimmed and lower-cased. The `id` and
//! `createdat` columns feed the record identity and timestamp; every other
//! column becomes a domain field. Required fields missing from a row are
//! filled with placeholder values.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::record::Record;

/// Required fields and the placeholder written when a record lacks one.
pub const REQUIRED_FIELDS: [(&str, &str); 3] = [
    ("title", "Untitled"),
    ("author", "Unknown author"),
    ("category", "Uncategorized"),
];

const ID_COLUMN: &str = "id";
const CREATED_AT_COLUMN: &str = "createdAt";

/// Mapping from external column labels to internal field names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    columns: BTreeMap<String, String>,
}

impl FieldMapping {
    /// Mapping with no entries: every label passes through lower-cased
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, external: impl Into<String>, internal: impl Into<String>) -> Self {
        self.insert(external, internal);
        self
    }

    /// Map `external` to `internal`. Field names are stored trimmed and
    /// lower-cased, like every other field name in a record.
    pub fn insert(&mut self, external: impl Into<String>, internal: impl Into<String>) {
        self.columns.insert(
            external.into().trim().to_string(),
            field_name(&internal.into()),
        );
    }

    /// Internal field name for an external label
    pub fn to_internal(&self, external: &str) -> String {
        let label = external.trim();
        match self.columns.get(label) {
            // Entries read from a config file bypass `insert`.
            Some(internal) => field_name(internal),
            None => field_name(label),
        }
    }

    /// External label for an internal field name, the name itself if unmapped
    pub fn to_external(&self, internal: &str) -> String {
        let wanted = field_name(internal);
        self.columns
            .iter()
            .find(|(_, v)| field_name(v) == wanted)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| internal.to_string())
    }

    /// Number of explicit entries
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True if no explicit entries exist
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn field_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Fill any missing or blank required field with its placeholder.
/// Returns how many fields were filled.
pub fn fill_required(record: &mut Record) -> usize {
    let mut filled = 0;
    for (field, placeholder) in REQUIRED_FIELDS {
        if record.get(field).map_or(true, |v| v.is_blank()) {
            record.set(field, placeholder);
            filled += 1;
        }
    }
    filled
}

enum Column {
    Id,
    CreatedAt,
    Field(String),
}

fn row_error(e: csv::Error) -> StoreError {
    match e.kind() {
        csv::ErrorKind::UnequalLengths {
            pos,
            expected_len,
            len,
        } => StoreError::Validation(format!(
            "row at line {} has {len} columns, header has {expected_len}",
            pos.as_ref().map(|p| p.line()).unwrap_or(0)
        )),
        _ => StoreError::Csv(e),
    }
}

/// Parse a CSV document with a header row into records.
pub fn import_csv<R: Read>(reader: R, mapping: &FieldMapping) -> Result<Vec<Record>, StoreError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = rdr.headers().map_err(row_error)?.clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(StoreError::Validation("document has no header row".to_string()));
    }

    let mut seen = BTreeSet::new();
    let mut columns = Vec::with_capacity(headers.len());
    for (i, label) in headers.iter().enumerate() {
        let internal = mapping.to_internal(label);
        if internal.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "column {} has an empty name",
                i + 1
            )));
        }
        if !seen.insert(internal.to_lowercase()) {
            return Err(StoreError::Validation(format!(
                "column {label:?} maps to {internal:?}, which appears more than once"
            )));
        }
        columns.push(if internal == ID_COLUMN {
            Column::Id
        } else if internal.eq_ignore_ascii_case(CREATED_AT_COLUMN) {
            Column::CreatedAt
        } else {
            Column::Field(internal)
        });
    }

    let mut records = Vec::new();
    let mut placeholders = 0usize;
    for row in rdr.records() {
        let row = row.map_err(row_error)?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        let mut record = Record::new();
        for (column, cell) in columns.iter().zip(row.iter()) {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }
            match column {
                Column::Id => record.id = cell.to_string(),
                Column::CreatedAt => {
                    record.created_at = DateTime::parse_from_rfc3339(cell)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            StoreError::Validation(format!(
                                "line {line}: createdAt {cell:?} is not RFC 3339: {e}"
                            ))
                        })?;
                }
                Column::Field(name) => record.set(name.clone(), cell),
            }
        }
        placeholders += fill_required(&mut record);
        records.push(record);
    }

    info!(
        rows = records.len(),
        columns = columns.len(),
        placeholders,
        "Imported CSV document"
    );
    Ok(records)
}

/// Write records as CSV: id, createdAt, the required fields, then every
/// other field in name order. Headers go through `mapping` in reverse.
pub fn export_csv<W: Write>(
    records: &[Record],
    mapping: &FieldMapping,
    writer: W,
) -> Result<(), StoreError> {
    let required: Vec<&str> = REQUIRED_FIELDS.iter().map(|(f, _)| *f).collect();
    let extra: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .filter(|f| !required.contains(f))
        .collect();
    let fields: Vec<&str> = required.iter().copied().chain(extra).collect();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec![mapping.to_external(ID_COLUMN), mapping.to_external(CREATED_AT_COLUMN)];
    header.extend(fields.iter().map(|f| mapping.to_external(f)));
    wtr.write_record(&header)?;

    for record in records {
        let mut row = vec![record.id.clone(), record.created_at.to_rfc3339()];
        row.extend(fields.iter().map(|f| record.text(f)));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    debug!(rows = records.len(), columns = header.len(), "Exported CSV document");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FieldValue;

    fn import(doc: &str, mapping: &FieldMapping) -> Result<Vec<Record>, StoreError> {
        import_csv(doc.as_bytes(), mapping)
    }

    #[test]
    fn mapped_and_passthrough_columns() {
        let mapping = FieldMapping::new()
            .with("Book Title", "title")
            .with("Writer", "author");
        let doc = "Book Title,Writer,Category,Shelf Location\nDune,Herbert,SciFi,B2\n";
        let records = import(doc, &mapping).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.text("title"), "Dune");
        assert_eq!(r.text("author"), "Herbert");
        assert_eq!(r.text("category"), "SciFi");
        assert_eq!(r.text("shelf location"), "B2");
        assert!(!r.id.is_empty());
    }

    #[test]
    fn missing_required_fields_get_placeholders() {
        let doc = "title,status\n,available\nEmma,\n";
        let records = import(doc, &FieldMapping::new()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text("title"), "Untitled");
        assert_eq!(records[0].text("author"), "Unknown author");
        assert_eq!(records[0].text("category"), "Uncategorized");
        assert_eq!(records[0].text("status"), "available");
        assert_eq!(records[1].text("title"), "Emma");
        assert!(records[1].get("status").is_none());
    }

    #[test]
    fn id_and_created_at_columns() {
        let doc = "ID,CreatedAt,title\nb-7,2023-05-01T10:00:00Z,Dune\n";
        let records = import(doc, &FieldMapping::new()).unwrap();
        assert_eq!(records[0].id, "b-7");
        assert_eq!(records[0].created_at.to_rfc3339(), "2023-05-01T10:00:00+00:00");
        assert!(records[0].get("createdat").is_none());
    }

    #[test]
    fn bad_timestamp_is_validation_error() {
        let doc = "title,createdAt\nDune,yesterday\n";
        assert!(matches!(
            import(doc, &FieldMapping::new()),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn ragged_row_is_validation_error() {
        let doc = "title,author\nDune,Herbert,extra\n";
        assert!(matches!(
            import(doc, &FieldMapping::new()),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn empty_document_is_validation_error() {
        assert!(matches!(
            import("", &FieldMapping::new()),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_mapped_columns_rejected() {
        let mapping = FieldMapping::new().with("Name", "title");
        let doc = "Name,Title\nA,B\n";
        assert!(matches!(import(doc, &mapping), Err(StoreError::Validation(_))));
    }

    #[test]
    fn blank_rows_are_skipped() {
        let doc = "title,author\n,\nDune,Herbert\n";
        assert_eq!(import(doc, &FieldMapping::new()).unwrap().len(), 1);
    }

    #[test]
    fn export_then_import_preserves_records() {
        let mapping = FieldMapping::new().with("Book Title", "title");
        let mut record = Record::new()
            .field("title", "Dune, Part \"One\"")
            .field("author", "Herbert")
            .field("category", "SciFi")
            .field("series", "1");
        record.created_at = DateTime::parse_from_rfc3339("2024-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut out = Vec::new();
        export_csv(std::slice::from_ref(&record), &mapping, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("id,createdAt,Book Title,author,category,series\n"));

        let back = import(&text, &mapping).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0], record);
    }

    #[test]
    fn export_renders_numbers_as_text() {
        let record = Record::new().field("title", "T").field("copies", FieldValue::Number(3.0));
        let mut out = Vec::new();
        export_csv(&[record], &FieldMapping::new(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.lines().nth(1).unwrap().ends_with(",3"));
    }

    #[test]
    fn mapping_reverse_lookup() {
        let mapping = FieldMapping::new().with("Writer", "author");
        assert_eq!(mapping.to_external("author"), "Writer");
        assert_eq!(mapping.to_external("title"), "title");
        assert_eq!(mapping.to_internal("  Publisher "), "publisher");
    }

    #[test]
    fn mapped_field_names_are_case_folded() {
        let mapping = FieldMapping::new().with("Book Title", " Title ");
        assert_eq!(mapping.to_internal("Book Title"), "title");
        assert_eq!(mapping.to_external("title"), "Book Title");

        let records = import("Book Title,Writer\nDune,Herbert\n", &mapping).unwrap();
        assert_eq!(records[0].text("title"), "Dune");
        assert!(records[0].get("Title").is_none());

        let loaded: FieldMapping = serde_json::from_str(r#"{"Book Title": "TITLE"}"#).unwrap();
        assert_eq!(loaded.to_internal("Book Title"), "title");
    }
}
