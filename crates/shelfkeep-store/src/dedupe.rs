//! Near-duplicate detection over catalog records.
//!
//! Each record is reduced to an equivalence key: the normalized values of a
//! caller-chosen list of fields. Keys are fingerprinted with BLAKE3 and
//! grouped; within a group the record with the earliest `createdAt` survives
//! (earliest position on ties) and the rest are removed.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::record::Record;

/// Number words recognized by default in sequence fields.
const ENGLISH_NUMERALS: &[(&str, &str)] = &[
    ("zero", "0"),
    ("one", "1"),
    ("two", "2"),
    ("three", "3"),
    ("four", "4"),
    ("five", "5"),
    ("six", "6"),
    ("seven", "7"),
    ("eight", "8"),
    ("nine", "9"),
    ("ten", "10"),
    ("eleven", "11"),
    ("twelve", "12"),
    ("thirteen", "13"),
    ("fourteen", "14"),
    ("fifteen", "15"),
    ("sixteen", "16"),
    ("seventeen", "17"),
    ("eighteen", "18"),
    ("nineteen", "19"),
    ("twenty", "20"),
];

/// Lookup table from numeral words to canonical digit strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumeralTable {
    words: HashMap<String, String>,
}

impl NumeralTable {
    /// Table with no entries
    pub fn empty() -> Self {
        Self {
            words: HashMap::new(),
        }
    }

    /// English number words zero through twenty
    pub fn english() -> Self {
        Self::from_pairs(ENGLISH_NUMERALS.iter().copied())
    }

    /// Build a table from (word, digits) pairs. Words are case-folded.
    pub fn from_pairs<I, W, D>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (W, D)>,
        W: AsRef<str>,
        D: Into<String>,
    {
        let mut table = Self::empty();
        table.extend(pairs);
        table
    }

    /// Add or replace entries
    pub fn extend<I, W, D>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (W, D)>,
        W: AsRef<str>,
        D: Into<String>,
    {
        for (word, digits) in pairs {
            self.words
                .insert(word.as_ref().trim().to_lowercase(), digits.into());
        }
    }

    /// Canonical form of an already case-folded token
    pub fn canonical<'a>(&'a self, token: &'a str) -> &'a str {
        self.words.get(token).map(String::as_str).unwrap_or(token)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// True if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl Default for NumeralTable {
    fn default() -> Self {
        Self::english()
    }
}

/// Configuration for duplicate resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Fields compared when the caller does not name any
    pub default_fields: Vec<String>,
    /// Fields holding a sequence or volume number; numeral words are mapped to digits
    pub sequence_fields: Vec<String>,
    /// Extra numeral words on top of the English table (word → digits)
    pub numerals: BTreeMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            default_fields: vec![
                "title".to_string(),
                "author".to_string(),
                "series".to_string(),
            ],
            sequence_fields: vec!["series".to_string(), "volume".to_string()],
            numerals: BTreeMap::new(),
        }
    }
}

/// One set of records sharing an equivalence key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    /// Normalized field values shared by the group
    pub key: Vec<String>,
    /// Id of the surviving record
    pub kept: String,
    /// Ids of the records dropped, in original order
    pub removed: Vec<String>,
}

/// Outcome of [`DuplicateResolver::resolve`]
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Surviving records, in their original relative order
    pub kept: Vec<Record>,
    /// Number of records dropped across all groups
    pub removed: usize,
    /// Per-group detail, ordered by first appearance
    pub groups: Vec<DuplicateGroup>,
}

/// Normalizes records and removes those with equal equivalence keys.
#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    numerals: NumeralTable,
    sequence_fields: HashSet<String>,
}

impl Default for DuplicateResolver {
    fn default() -> Self {
        Self::new(&ResolverConfig::default())
    }
}

impl DuplicateResolver {
    /// Create a resolver from configuration
    pub fn new(config: &ResolverConfig) -> Self {
        let mut numerals = NumeralTable::english();
        numerals.extend(config.numerals.iter().map(|(w, d)| (w, d.clone())));
        Self {
            numerals,
            sequence_fields: config.sequence_fields.iter().map(|f| field_name(f)).collect(),
        }
    }

    /// Create a resolver with an explicit numeral table
    pub fn with_numerals(numerals: NumeralTable, sequence_fields: &[&str]) -> Self {
        Self {
            numerals,
            sequence_fields: sequence_fields.iter().map(|f| field_name(f)).collect(),
        }
    }

    /// Normalize one field value: trim and case-fold; sequence fields also
    /// collapse whitespace and map numeral words to digits.
    pub fn normalize(&self, field: &str, value: &str) -> String {
        let folded = value.trim().to_lowercase();
        if !self.sequence_fields.contains(field) {
            return folded;
        }
        folded
            .split_whitespace()
            .map(|token| self.numerals.canonical(token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Normalized values of `fields` for `record`; absent fields become "".
    /// Field names are matched trimmed and case-folded.
    pub fn equivalence_key<F: AsRef<str>>(&self, record: &Record, fields: &[F]) -> Vec<String> {
        fields
            .iter()
            .map(|f| {
                let name = field_name(f.as_ref());
                self.normalize(&name, &record.text(&name))
            })
            .collect()
    }

    /// Group records by equivalence key without modifying them.
    pub fn find_duplicates<F: AsRef<str>>(
        &self,
        records: &[Record],
        fields: &[F],
    ) -> Result<Vec<DuplicateGroup>, StoreError> {
        Ok(self
            .group_positions(records, fields)?
            .into_iter()
            .map(|g| g.describe(records))
            .collect())
    }

    /// Drop every record whose equivalence key matches an earlier-created one.
    pub fn resolve<F: AsRef<str>>(
        &self,
        records: Vec<Record>,
        fields: &[F],
    ) -> Result<Resolution, StoreError> {
        let positional = self.group_positions(&records, fields)?;
        let dropped: HashSet<usize> = positional
            .iter()
            .flat_map(|g| g.dropped.iter().copied())
            .collect();
        let groups: Vec<DuplicateGroup> = positional
            .into_iter()
            .map(|g| g.describe(&records))
            .collect();

        let total = records.len();
        let kept: Vec<Record> = records
            .into_iter()
            .enumerate()
            .filter(|(pos, _)| !dropped.contains(pos))
            .map(|(_, r)| r)
            .collect();
        let removed = total - kept.len();

        info!(
            records = total,
            kept = kept.len(),
            removed,
            groups = groups.len(),
            "Duplicate resolution complete"
        );
        Ok(Resolution {
            kept,
            removed,
            groups,
        })
    }

    fn group_positions<F: AsRef<str>>(
        &self,
        records: &[Record],
        fields: &[F],
    ) -> Result<Vec<PositionalGroup>, StoreError> {
        let fields = validate_fields(fields)?;
        if !records.is_empty()
            && !records
                .iter()
                .any(|r| fields.iter().any(|f| r.get(f).is_some()))
        {
            return Err(StoreError::Validation(format!(
                "no record has any of the fields {}",
                fields.join(", ")
            )));
        }
        let keys: Vec<Vec<String>> = records
            .iter()
            .map(|r| self.equivalence_key(r, &fields))
            .collect();

        let mut order: Vec<blake3::Hash> = Vec::new();
        let mut members: HashMap<blake3::Hash, Vec<usize>> = HashMap::new();
        for (pos, key) in keys.iter().enumerate() {
            let fp = fingerprint(key);
            members
                .entry(fp)
                .or_insert_with(|| {
                    order.push(fp);
                    Vec::new()
                })
                .push(pos);
        }

        let mut groups = Vec::new();
        for fp in order {
            let positions = &members[&fp];
            if positions.len() < 2 {
                continue;
            }
            // Earliest createdAt wins; position breaks ties.
            let survivor = positions
                .iter()
                .copied()
                .min_by_key(|&p| (records[p].created_at, p))
                .unwrap_or(positions[0]);
            debug!(
                kept = %records[survivor].id,
                dropped = positions.len() - 1,
                "Duplicate group"
            );
            groups.push(PositionalGroup {
                key: keys[survivor].clone(),
                survivor,
                dropped: positions.iter().copied().filter(|&p| p != survivor).collect(),
            });
        }
        Ok(groups)
    }
}

struct PositionalGroup {
    key: Vec<String>,
    survivor: usize,
    dropped: Vec<usize>,
}

impl PositionalGroup {
    fn describe(self, records: &[Record]) -> DuplicateGroup {
        DuplicateGroup {
            key: self.key,
            kept: records[self.survivor].id.clone(),
            removed: self.dropped.iter().map(|&p| records[p].id.clone()).collect(),
        }
    }
}

fn field_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn validate_fields<F: AsRef<str>>(fields: &[F]) -> Result<Vec<String>, StoreError> {
    if fields.is_empty() {
        return Err(StoreError::Validation(
            "duplicate resolution needs at least one field".to_string(),
        ));
    }
    let names: Vec<String> = fields.iter().map(|f| field_name(f.as_ref())).collect();
    if names.iter().any(|n| n.is_empty()) {
        return Err(StoreError::Validation("field names must not be blank".to_string()));
    }
    Ok(names)
}

/// BLAKE3 over length-prefixed key components, so ("ab","c") != ("a","bc").
fn fingerprint(key: &[String]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for part in key {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;

    const FIELDS: [&str; 3] = ["title", "author", "series"];

    fn book(id: &str, minutes: i64, title: &str, author: &str, series: &str) -> Record {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Record::with_id(id, base + Duration::minutes(minutes))
            .field("title", title)
            .field("author", author)
            .field("series", series)
    }

    #[test]
    fn numeral_word_matches_digit() {
        let records = vec![
            book("1", 0, "X", "Y", "1"),
            book("2", 5, "x ", " y", "one"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        assert_eq!(res.removed, 1);
        assert_eq!(res.kept.len(), 1);
        assert_eq!(res.kept[0].id, "1");
        assert_eq!(res.groups[0].kept, "1");
        assert_eq!(res.groups[0].removed, vec!["2"]);
        assert_eq!(res.groups[0].key, vec!["x", "y", "1"]);
    }

    #[test]
    fn earliest_created_survives_regardless_of_position() {
        let records = vec![
            book("late", 30, "Dune", "Herbert", "1"),
            book("other", 0, "Emma", "Austen", ""),
            book("early", 10, "DUNE", "herbert", "One"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        let ids: Vec<_> = res.kept.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["other", "early"]);
        assert_eq!(res.removed, 1);
    }

    #[test]
    fn equal_timestamps_fall_back_to_position() {
        let records = vec![
            book("a", 0, "Dune", "Herbert", "1"),
            book("b", 0, "dune", "herbert", "1"),
            book("c", 0, "dune", "HERBERT", "one"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        assert_eq!(res.kept.len(), 1);
        assert_eq!(res.kept[0].id, "a");
        assert_eq!(res.removed, 2);
        assert_eq!(res.groups[0].removed, vec!["b", "c"]);
    }

    #[test]
    fn differing_field_keeps_both() {
        let records = vec![
            book("a", 0, "Dune", "Herbert", "1"),
            book("b", 1, "Dune", "Herbert", "2"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        assert_eq!(res.removed, 0);
        assert!(res.groups.is_empty());
    }

    #[test]
    fn numerals_only_apply_to_sequence_fields() {
        let records = vec![
            book("a", 0, "one", "Anon", "1"),
            book("b", 1, "1", "Anon", "1"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        assert_eq!(res.removed, 0);
    }

    #[test]
    fn duplicate_ids_are_handled_by_position() {
        let records = vec![
            book("same", 0, "A", "B", "1"),
            book("same", 1, "a", "b", "1"),
            book("same", 2, "Other", "B", "1"),
        ];
        let res = DuplicateResolver::default().resolve(records, &FIELDS).unwrap();
        assert_eq!(res.kept.len(), 2);
        assert_eq!(res.kept[1].text("title"), "Other");
    }

    #[test]
    fn empty_fields_rejected() {
        let none: [&str; 0] = [];
        assert!(matches!(
            DuplicateResolver::default().resolve(Vec::new(), &none),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            DuplicateResolver::default().find_duplicates(&[], &["title", " "]),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn custom_numeral_table() {
        let table = NumeralTable::from_pairs([("Eins", "1"), ("zwei", "2")]);
        let resolver = DuplicateResolver::with_numerals(table, &["band"]);
        assert_eq!(resolver.normalize("band", "  EINS "), "1");
        assert_eq!(resolver.normalize("band", "Band   zwei"), "band 2");
        assert_eq!(resolver.normalize("title", " Band  Zwei "), "band  zwei");
    }

    #[test]
    fn config_numerals_extend_english() {
        let mut config = ResolverConfig::default();
        config.numerals.insert("Uno".to_string(), "1".to_string());
        let resolver = DuplicateResolver::new(&config);
        assert_eq!(resolver.normalize("series", "uno"), "1");
        assert_eq!(resolver.normalize("series", "one"), "1");
    }

    #[test]
    fn missing_fields_compare_equal() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let records = vec![
            Record::with_id("a", base).field("title", "Dune"),
            Record::with_id("b", base).field("title", "dune"),
        ];
        let groups = DuplicateResolver::default()
            .find_duplicates(&records, &FIELDS)
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, vec!["dune", "", ""]);
    }

    #[test]
    fn field_names_are_case_folded() {
        let records = vec![
            book("a", 0, "Dune", "Herbert", "1"),
            book("b", 1, "Emma", "Austen", "1"),
            book("c", 2, "dune", "herbert", "one"),
        ];
        let res = DuplicateResolver::default()
            .resolve(records, &["Title", " AUTHOR "])
            .unwrap();
        assert_eq!(res.removed, 1);
        assert_eq!(res.groups[0].removed, vec!["c"]);
    }

    #[test]
    fn fields_absent_from_every_record_rejected() {
        let records = vec![
            book("a", 0, "Dune", "Herbert", "1"),
            book("b", 1, "Emma", "Austen", "1"),
        ];
        let resolver = DuplicateResolver::default();
        assert!(matches!(
            resolver.resolve(records.clone(), &["isbn"]),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            resolver.find_duplicates(&records, &["isbn", "publisher"]),
            Err(StoreError::Validation(_))
        ));
        assert!(resolver.resolve(Vec::new(), &["isbn"]).unwrap().kept.is_empty());
    }

    #[test]
    fn fingerprint_is_unambiguous() {
        let a = fingerprint(&["ab".to_string(), "c".to_string()]);
        let b = fingerprint(&["a".to_string(), "bc".to_string()]);
        assert_ne!(a, b);
    }

    fn arb_records() -> impl Strategy<Value = Vec<Record>> {
        let value = prop::sample::select(vec!["Dune", "dune ", "Emma", "one", "1", "Two", "2", ""]);
        prop::collection::vec((value.clone(), value.clone(), value, 0i64..5), 0..30).prop_map(
            |rows| {
                rows.into_iter()
                    .enumerate()
                    .map(|(i, (t, a, s, m))| book(&i.to_string(), m, t, a, s))
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn prop_resolve_is_idempotent(records in arb_records()) {
            let resolver = DuplicateResolver::default();
            let first = resolver.resolve(records.clone(), &FIELDS).unwrap();
            prop_assert_eq!(first.kept.len() + first.removed, records.len());
            let second = resolver.resolve(first.kept.clone(), &FIELDS).unwrap();
            prop_assert_eq!(second.removed, 0);
            prop_assert_eq!(second.kept, first.kept);
        }
    }
}
