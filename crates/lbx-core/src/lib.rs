//! Core domain model for the Local Business Index sync engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbx-core";

/// Normalized business-name identity shared by source and target rows.
///
/// Normalization is trim + Unicode lowercase + collapsing internal
/// whitespace runs to a single space. `Ord` is byte order of the
/// normalized string, which is the ascending order every cursor uses.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Returns `None` when nothing remains after normalization.
    pub fn normalize(raw: &str) -> Option<Self> {
        let folded = raw.trim().to_lowercase();
        let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            None
        } else {
            Some(Self(collapsed))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory record as read from the authoritative dataset.
///
/// Owned and mutated by upstream ingestion; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub hours: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub wheelchair_accessible: Option<bool>,
    pub accepts_cards: Option<bool>,
    /// Raw rating text; parsed (with a default on failure) during mapping.
    pub rating: Option<String>,
}

impl SourceRecord {
    pub fn natural_key(&self) -> Option<NaturalKey> {
        NaturalKey::normalize(&self.name)
    }
}

/// External row identifier. Lexicographic order decides which duplicate
/// survives a prune pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRecordId(String);

impl TargetRecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetRecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row as currently stored in the external table service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRow {
    pub id: TargetRecordId,
    pub fields: BTreeMap<String, JsonValue>,
}

/// One page of target rows plus the continuation token for the next page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetPage {
    pub rows: Vec<TargetRow>,
    pub next_offset: Option<String>,
}

/// Field map submitted on create. Only present fields are serialized;
/// empty strings are omitted rather than sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetPayload {
    fields: BTreeMap<String, JsonValue>,
}

impl TargetPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trims the value and omits the field entirely when empty.
    pub fn set_string(&mut self, column: &str, value: &str) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            self.fields
                .insert(column.to_string(), JsonValue::String(trimmed.to_string()));
        }
    }

    pub fn set_opt_string(&mut self, column: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.set_string(column, value);
        }
    }

    pub fn set_bool(&mut self, column: &str, value: bool) {
        self.fields.insert(column.to_string(), JsonValue::Bool(value));
    }

    pub fn set_number(&mut self, column: &str, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(column.to_string(), JsonValue::Number(number));
        }
    }

    pub fn fields(&self) -> &BTreeMap<String, JsonValue> {
        &self.fields
    }

    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.fields.get(column)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Natural key to observed target ids, rebuilt fresh every run.
///
/// Built once while paging the target store, then treated as immutable
/// input to reconciliation. After a successful prune pass every key maps
/// to exactly one id.
#[derive(Debug, Clone, Default)]
pub struct NaturalKeyIndex {
    entries: BTreeMap<NaturalKey, Vec<TargetRecordId>>,
}

impl NaturalKeyIndex {
    pub fn observe(&mut self, key: NaturalKey, id: TargetRecordId) {
        self.entries.entry(key).or_default().push(id);
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn ids_for(&self, key: &NaturalKey) -> &[TargetRecordId] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct keys observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicate_key_count(&self) -> usize {
        self.entries.values().filter(|ids| ids.len() > 1).count()
    }

    /// Every id except the lexicographically first for each key with more
    /// than one observation. Sorting makes repeated prune passes land on
    /// the same survivor.
    pub fn duplicates(&self) -> Vec<TargetRecordId> {
        let mut doomed = Vec::new();
        for ids in self.entries.values() {
            if ids.len() < 2 {
                continue;
            }
            let mut sorted = ids.clone();
            sorted.sort();
            doomed.extend(sorted.into_iter().skip(1));
        }
        doomed
    }
}

/// Durable cursor recording how far the lineage of runs has progressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_processed_key: Option<NaturalKey>,
    pub run_timestamp: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn empty() -> Self {
        Self {
            last_processed_key: None,
            run_timestamp: Utc::now(),
        }
    }

    pub fn at(key: NaturalKey) -> Self {
        Self {
            last_processed_key: Some(key),
            run_timestamp: Utc::now(),
        }
    }
}

/// Which write path a deferred batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredKind {
    Insert,
    Prune,
}

/// A batch that exhausted its retry budget. Recorded, never discarded;
/// the checkpoint does not advance past it, so the next run picks its
/// records up again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredBatch {
    pub kind: DeferredKind,
    pub first_key: Option<NaturalKey>,
    pub last_key: Option<NaturalKey>,
    pub record_count: usize,
    pub attempts: u32,
    pub reason: String,
}

/// Absorption form of a per-record mapping problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapWarning {
    pub key: Option<NaturalKey>,
    pub field: String,
    pub message: String,
}

impl fmt::Display for MapWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}: {}: {}", key, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn natural_key_trims_folds_and_collapses() {
        let key = NaturalKey::normalize("  Joe's   PIZZA \t Shack ").unwrap();
        assert_eq!(key.as_str(), "joe's pizza shack");
        assert_eq!(
            NaturalKey::normalize("Joe's Pizza Shack"),
            NaturalKey::normalize("JOE'S PIZZA   SHACK")
        );
    }

    #[test]
    fn natural_key_rejects_blank_input() {
        assert!(NaturalKey::normalize("").is_none());
        assert!(NaturalKey::normalize("   \t  ").is_none());
    }

    #[test]
    fn natural_key_orders_case_insensitively() {
        let a = NaturalKey::normalize("Acme Widgets").unwrap();
        let b = NaturalKey::normalize("bolt depot").unwrap();
        assert!(a < b);
    }

    #[test]
    fn payload_omits_empty_strings() {
        let mut payload = TargetPayload::new();
        payload.set_string("Name", "  Corner Cafe ");
        payload.set_string("Address", "   ");
        payload.set_opt_string("Phone", None);
        assert_eq!(
            payload.get("Name"),
            Some(&JsonValue::String("Corner Cafe".into()))
        );
        assert!(payload.get("Address").is_none());
        assert!(payload.get("Phone").is_none());
    }

    #[test]
    fn index_duplicates_keep_lexicographically_first() {
        let key = NaturalKey::normalize("Corner Cafe").unwrap();
        let mut index = NaturalKeyIndex::default();
        index.observe(key.clone(), TargetRecordId::new("row003"));
        index.observe(key.clone(), TargetRecordId::new("row001"));
        index.observe(key.clone(), TargetRecordId::new("row002"));

        let doomed = index.duplicates();
        assert_eq!(
            doomed,
            vec![TargetRecordId::new("row002"), TargetRecordId::new("row003")]
        );
        assert_eq!(index.duplicate_key_count(), 1);
        assert_eq!(index.ids_for(&key).len(), 3);
    }

    #[test]
    fn index_duplicates_skip_singletons() {
        let mut index = NaturalKeyIndex::default();
        index.observe(
            NaturalKey::normalize("Acme Widgets").unwrap(),
            TargetRecordId::new("row001"),
        );
        assert!(index.duplicates().is_empty());
        assert_eq!(index.duplicate_key_count(), 0);
    }
}
