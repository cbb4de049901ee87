//! Record store abstraction
//!
//! The tracking database itself lives outside this crate. Everything the
//! core needs from it goes through [`RecordStore`]; field fetches are batched
//! so a whole hierarchy level costs one round trip.
//!
//! [`MemoryStore`] is a local implementation backed by an in-memory table,
//! loadable from a YAML or JSON file. The CLI and the tests use it.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// A plain record as exchanged with the store: a JSON object with at least
/// `type` and (for saved records) `id`
pub type Record = Map<String, JsonValue>;

/// Errors raised by a record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: String, id: i64 },

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("failed to parse records file: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filter operators understood by [`RecordStore::find`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Is,
    IsNot,
    In,
}

/// A `[field, op, value]` filter triple
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: JsonValue,
}

impl Filter {
    pub fn is(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Is,
            value: value.into(),
        }
    }

    pub fn is_not(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::IsNot,
            value: value.into(),
        }
    }

    pub fn within(field: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In,
            value: JsonValue::Array(values),
        }
    }

    fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&JsonValue::Null);
        match self.op {
            FilterOp::Is => same_value(actual, &self.value),
            FilterOp::IsNot => !same_value(actual, &self.value),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|values| values.iter().any(|v| same_value(actual, v))),
        }
    }
}

/// Entity links compare by `(type, id)` only; everything else compares exactly
fn same_value(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (link_key(actual), link_key(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn link_key(value: &JsonValue) -> Option<(&str, i64)> {
    let obj = value.as_object()?;
    Some((obj.get("type")?.as_str()?, obj.get("id")?.as_i64()?))
}

/// One entity whose fields should be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub entity_type: String,
    pub id: i64,
    /// Field names to fetch; empty means every field
    pub fields: Vec<String>,
}

/// A single write inside [`RecordStore::batch`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchRequest {
    Create { entity_type: String, data: Record },
    Update { entity_type: String, id: i64, data: Record },
}

/// The remote tracking database
pub trait RecordStore {
    /// Find records of a type matching every filter, returning the requested
    /// fields (plus `type` and `id`)
    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
    ) -> Result<Vec<Record>, StoreError>;

    /// Find the first matching record
    fn find_one(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
    ) -> Result<Option<Record>, StoreError> {
        Ok(self.find(entity_type, filters, fields)?.into_iter().next())
    }

    /// Create a record and return it with its new id
    fn create(&mut self, entity_type: &str, data: Record) -> Result<Record, StoreError>;

    /// Update fields on an existing record and return the changed fields
    fn update(&mut self, entity_type: &str, id: i64, data: Record) -> Result<Record, StoreError>;

    /// Run several writes in one round trip
    fn batch(&mut self, requests: Vec<BatchRequest>) -> Result<Vec<Record>, StoreError> {
        requests
            .into_iter()
            .map(|req| match req {
                BatchRequest::Create { entity_type, data } => self.create(&entity_type, data),
                BatchRequest::Update {
                    entity_type,
                    id,
                    data,
                } => self.update(&entity_type, id, data),
            })
            .collect()
    }

    /// Fetch fields for several entities in a single round trip
    fn fetch(&self, requests: &[FetchRequest]) -> Result<Vec<Record>, StoreError>;
}

/// In-memory record store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, BTreeMap<i64, Record>>,
    next_id: i64,
    round_trips: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
            next_id: 1,
            round_trips: Cell::new(0),
        }
    }

    /// Load records from a YAML or JSON file
    ///
    /// The file holds either a list of records, or a mapping from entity
    /// type to a list of records of that type.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = fs::read_to_string(path)?;
        let value: JsonValue =
            serde_yml::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))?;
        Self::from_json(value)
    }

    /// Build a store from an already parsed document
    pub fn from_json(value: JsonValue) -> Result<Self, StoreError> {
        let mut store = Self::new();
        match value {
            JsonValue::Array(records) => {
                for record in records {
                    store.insert_json(record, None)?;
                }
            }
            JsonValue::Object(by_type) => {
                for (entity_type, records) in by_type {
                    let records = match records {
                        JsonValue::Array(records) => records,
                        _ => {
                            return Err(StoreError::InvalidRecord(format!(
                                "records for '{}' must be a list",
                                entity_type
                            )))
                        }
                    };
                    for record in records {
                        store.insert_json(record, Some(&entity_type))?;
                    }
                }
            }
            JsonValue::Null => {}
            _ => {
                return Err(StoreError::InvalidRecord(
                    "expected a list or a mapping of records".to_string(),
                ))
            }
        }
        Ok(store)
    }

    fn insert_json(&mut self, value: JsonValue, entity_type: Option<&str>) -> Result<(), StoreError> {
        let mut record = match value {
            JsonValue::Object(map) => map,
            _ => return Err(StoreError::InvalidRecord("record must be a mapping".to_string())),
        };
        if let Some(t) = entity_type {
            record
                .entry("type")
                .or_insert_with(|| JsonValue::String(t.to_string()));
        }
        self.insert(record)
    }

    /// Insert (or replace) a record; records without an id get a new one
    pub fn insert(&mut self, mut record: Record) -> Result<(), StoreError> {
        let entity_type = record
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| StoreError::InvalidRecord("record is missing 'type'".to_string()))?
            .to_string();

        let id = match record.get("id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                record.insert("id".to_string(), JsonValue::from(id));
                id
            }
        };
        self.next_id = self.next_id.max(id + 1);

        self.tables.entry(entity_type).or_default().insert(id, record);
        Ok(())
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id.max(1);
        self.next_id = id + 1;
        id
    }

    /// Number of read round trips served so far
    pub fn round_trips(&self) -> usize {
        self.round_trips.get()
    }

    /// Total number of stored records
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn project(record: &Record, fields: &[String]) -> Record {
        if fields.is_empty() {
            return record.clone();
        }
        let mut out = Record::new();
        for key in ["type", "id"] {
            if let Some(v) = record.get(key) {
                out.insert(key.to_string(), v.clone());
            }
        }
        for field in fields {
            out.insert(
                field.clone(),
                record.get(field).cloned().unwrap_or(JsonValue::Null),
            );
        }
        out
    }

    fn bump(&self) {
        self.round_trips.set(self.round_trips.get() + 1);
    }
}

impl RecordStore for MemoryStore {
    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
    ) -> Result<Vec<Record>, StoreError> {
        self.bump();
        let Some(table) = self.tables.get(entity_type) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|record| filters.iter().all(|f| f.matches(record)))
            .map(|record| Self::project(record, fields))
            .collect())
    }

    fn create(&mut self, entity_type: &str, mut data: Record) -> Result<Record, StoreError> {
        data.insert("type".to_string(), JsonValue::String(entity_type.to_string()));
        data.remove("id");
        let id = self.allocate_id();
        data.insert("id".to_string(), JsonValue::from(id));
        self.tables
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, data.clone());
        Ok(data)
    }

    fn update(&mut self, entity_type: &str, id: i64, data: Record) -> Result<Record, StoreError> {
        let record = self
            .tables
            .get_mut(entity_type)
            .and_then(|t| t.get_mut(&id))
            .ok_or_else(|| StoreError::NotFound {
                entity_type: entity_type.to_string(),
                id,
            })?;

        let mut changed = Record::new();
        changed.insert("type".to_string(), JsonValue::String(entity_type.to_string()));
        changed.insert("id".to_string(), JsonValue::from(id));
        for (k, v) in data {
            if k == "type" || k == "id" {
                continue;
            }
            record.insert(k.clone(), v.clone());
            changed.insert(k, v);
        }
        Ok(changed)
    }

    fn fetch(&self, requests: &[FetchRequest]) -> Result<Vec<Record>, StoreError> {
        self.bump();
        requests
            .iter()
            .map(|req| {
                self.tables
                    .get(&req.entity_type)
                    .and_then(|t| t.get(&req.id))
                    .map(|record| Self::project(record, &req.fields))
                    .ok_or_else(|| StoreError::NotFound {
                        entity_type: req.entity_type.clone(),
                        id: req.id,
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MemoryStore {
        MemoryStore::from_json(json!({
            "Project": [{"id": 1, "name": "Demo", "code": "demo"}],
            "Sequence": [
                {"id": 10, "code": "AA", "project": {"type": "Project", "id": 1}},
                {"id": 11, "code": "BB", "project": {"type": "Project", "id": 1}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_find_with_link_filter() {
        let store = sample();
        let found = store
            .find(
                "Sequence",
                &[Filter::is("project", json!({"type": "Project", "id": 1}))],
                &["code".to_string()],
            )
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0]["code"], "AA");
        assert!(found[0].get("project").is_none());
    }

    #[test]
    fn test_find_one_and_in_filter() {
        let store = sample();
        let found = store
            .find_one("Sequence", &[Filter::within("code", vec![json!("BB")])], &[])
            .unwrap()
            .unwrap();
        assert_eq!(found["id"], 11);
    }

    #[test]
    fn test_fetch_is_one_round_trip() {
        let store = sample();
        let before = store.round_trips();
        let records = store
            .fetch(&[
                FetchRequest {
                    entity_type: "Sequence".into(),
                    id: 10,
                    fields: vec!["project".into()],
                },
                FetchRequest {
                    entity_type: "Sequence".into(),
                    id: 11,
                    fields: vec!["project".into()],
                },
            ])
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(store.round_trips(), before + 1);
    }

    #[test]
    fn test_fetch_missing_record() {
        let store = sample();
        let err = store
            .fetch(&[FetchRequest {
                entity_type: "Shot".into(),
                id: 99,
                fields: vec![],
            }])
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 99, .. }));
    }

    #[test]
    fn test_create_and_update() {
        let mut store = sample();
        let created = store.create("Shot", Record::new()).unwrap();
        let id = created["id"].as_i64().unwrap();
        assert!(id > 11);

        let mut data = Record::new();
        data.insert("code".into(), json!("AA_001"));
        let changed = store.update("Shot", id, data).unwrap();
        assert_eq!(changed["code"], "AA_001");
        assert_eq!(store.len(), 4);
    }
}
