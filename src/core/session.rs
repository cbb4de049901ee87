//! Per-operation entity session
//!
//! A [`Session`] owns every entity record touched during one operation.
//! Records are stored in an arena and addressed by [`Entity`] handles; saved
//! records (those with an id) are deduplicated by `(type, id)`, so merging the
//! same record twice always yields the same handle.
//!
//! Merging is additive: known fields are never dropped, only added or
//! overwritten. Entity-shaped fields (`{type, id, ...}`) are merged into the
//! session recursively.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::core::entity::{Entity, EntityKey, Value};
use crate::core::hierarchy::ParentFields;
use crate::core::store::{BatchRequest, FetchRequest, Filter, Record, RecordStore, StoreError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors raised by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("entity belongs to session {found}, not to session {expected}")]
    Ownership { expected: u64, found: u64 },

    #[error("record is missing a string 'type' field")]
    MissingType,

    #[error("record field 'id' is not an integer: {0}")]
    InvalidId(String),

    #[error("expected a record mapping, got {0}")]
    NotARecord(String),

    #[error("{0} has not been saved and has no id")]
    Unsaved(String),

    #[error("no record store is attached to this session")]
    NoStore,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Canonical data for one entity
#[derive(Debug, Clone)]
pub struct EntityData {
    entity_type: String,
    id: Option<i64>,
    fields: BTreeMap<String, Value>,
    /// Resolved parent; `Some(None)` caches "has no parent"
    parent: Option<Option<Entity>>,
}

impl EntityData {
    fn new(entity_type: String, id: Option<i64>) -> Self {
        Self {
            entity_type,
            id,
            fields: BTreeMap::new(),
            parent: None,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id.map(|id| EntityKey::new(self.entity_type.clone(), id))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn has(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

/// Input accepted by [`Session::merge`]
#[derive(Debug, Clone)]
pub enum RawEntity {
    Fields(Record),
    Entity(Entity),
}

impl From<Record> for RawEntity {
    fn from(record: Record) -> Self {
        RawEntity::Fields(record)
    }
}

impl From<Entity> for RawEntity {
    fn from(entity: Entity) -> Self {
        RawEntity::Entity(entity)
    }
}

/// Keyed entity store for one root operation
pub struct Session {
    id: u64,
    entities: Vec<EntityData>,
    index: HashMap<EntityKey, usize>,
    parent_fields: ParentFields,
    store: Option<Box<dyn RecordStore>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("entities", &self.entities.len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl Session {
    /// Create an empty session with no record store
    pub fn new() -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            entities: Vec::new(),
            index: HashMap::new(),
            parent_fields: ParentFields::default(),
            store: None,
        }
    }

    /// Create a session that fetches missing fields from `store`
    pub fn with_store(store: impl RecordStore + 'static) -> Self {
        let mut session = Self::new();
        session.store = Some(Box::new(store));
        session
    }

    pub fn with_parent_fields(mut self, parent_fields: ParentFields) -> Self {
        self.parent_fields = parent_fields;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_fields(&self) -> &ParentFields {
        &self.parent_fields
    }

    pub fn store(&self) -> Option<&dyn RecordStore> {
        self.store.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All entities in merge order
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        (0..self.entities.len()).map(|i| Entity::new(self.id, i))
    }

    fn check(&self, entity: Entity) -> Result<usize, SessionError> {
        if entity.session_id() != self.id || entity.index() >= self.entities.len() {
            return Err(SessionError::Ownership {
                expected: self.id,
                found: entity.session_id(),
            });
        }
        Ok(entity.index())
    }

    /// Data for an entity owned by this session
    pub fn get(&self, entity: Entity) -> Option<&EntityData> {
        self.check(entity).ok().map(|i| &self.entities[i])
    }

    /// Data for an entity, failing with an ownership error for foreign handles
    pub fn data(&self, entity: Entity) -> Result<&EntityData, SessionError> {
        let idx = self.check(entity)?;
        Ok(&self.entities[idx])
    }

    pub fn field(&self, entity: Entity, name: &str) -> Option<&Value> {
        self.get(entity).and_then(|d| d.get(name))
    }

    pub fn entity_type(&self, entity: Entity) -> Option<&str> {
        self.get(entity).map(|d| d.entity_type())
    }

    pub fn key(&self, entity: Entity) -> Option<EntityKey> {
        self.get(entity).and_then(|d| d.key())
    }

    /// Canonical handle for a saved record, if it has been merged
    pub fn lookup(&self, key: &EntityKey) -> Option<Entity> {
        self.index.get(key).map(|&i| Entity::new(self.id, i))
    }

    // =========================================================================
    // Merging
    // =========================================================================

    /// Merge a record (or an existing handle) and return the canonical entity
    pub fn merge(&mut self, raw: impl Into<RawEntity>) -> Result<Entity, SessionError> {
        match raw.into() {
            RawEntity::Entity(entity) => {
                self.check(entity)?;
                Ok(entity)
            }
            RawEntity::Fields(record) => {
                let idx = self.merge_record(&record)?;
                Ok(Entity::new(self.id, idx))
            }
        }
    }

    /// Merge a JSON value that must be a record mapping
    pub fn merge_json(&mut self, value: &JsonValue) -> Result<Entity, SessionError> {
        match value {
            JsonValue::Object(record) => {
                let idx = self.merge_record(record)?;
                Ok(Entity::new(self.id, idx))
            }
            other => Err(SessionError::NotARecord(other.to_string())),
        }
    }

    fn merge_record(&mut self, record: &Record) -> Result<usize, SessionError> {
        let entity_type = record
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(SessionError::MissingType)?
            .to_string();
        let id = parse_id(record.get("id"))?;

        let idx = match id {
            Some(id) => {
                let key = EntityKey::new(entity_type.clone(), id);
                match self.index.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        self.entities.push(EntityData::new(entity_type, Some(id)));
                        let idx = self.entities.len() - 1;
                        self.index.insert(key, idx);
                        idx
                    }
                }
            }
            None => {
                self.entities.push(EntityData::new(entity_type, None));
                self.entities.len() - 1
            }
        };

        self.merge_fields_into(idx, record)?;
        Ok(idx)
    }

    fn merge_fields_into(&mut self, idx: usize, record: &Record) -> Result<(), SessionError> {
        for (name, value) in record {
            if name == "type" || name == "id" {
                continue;
            }
            self.merge_field(idx, name, value)?;
        }
        Ok(())
    }

    fn merge_field(&mut self, idx: usize, name: &str, value: &JsonValue) -> Result<(), SessionError> {
        // Unsaved nested records are only reachable through their field, so an
        // incoming record with the same type and no id updates them in place
        if let Some(incoming) = entity_shape(value) {
            if let Some(target) = self.entities[idx].fields.get(name).and_then(Value::as_entity) {
                let existing = &self.entities[target.index()];
                let same_type =
                    incoming.get("type").and_then(|t| t.as_str()) == Some(existing.entity_type.as_str());
                if same_type && existing.id.is_none() && parse_id(incoming.get("id"))?.is_none() {
                    return self.merge_fields_into(target.index(), incoming);
                }
            }
        }

        let converted = self.convert(value)?;
        let data = &mut self.entities[idx];
        if self.parent_fields.field_for(&data.entity_type) == Some(name) {
            data.parent = None;
        }
        data.fields.insert(name.to_string(), converted);
        Ok(())
    }

    fn convert(&mut self, value: &JsonValue) -> Result<Value, SessionError> {
        Ok(match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Str(s.clone()),
            JsonValue::Array(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.convert(item))
                    .collect::<Result<_, _>>()?,
            ),
            JsonValue::Object(obj) => {
                if entity_shape(value).is_some() {
                    let idx = self.merge_record(obj)?;
                    Value::Entity(Entity::new(self.id, idx))
                } else {
                    let mut map = BTreeMap::new();
                    for (k, v) in obj {
                        map.insert(k.clone(), self.convert(v)?);
                    }
                    Value::Map(map)
                }
            }
        })
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Canonical parent of an entity
    ///
    /// The parent field comes from the static [`ParentFields`] table. When the
    /// field is not known yet it is fetched from the record store.
    pub fn parent(&mut self, entity: Entity) -> Result<Option<Entity>, SessionError> {
        let idx = self.check(entity)?;
        if let Some(cached) = self.entities[idx].parent {
            return Ok(cached);
        }

        let field = match self.parent_fields.field_for(&self.entities[idx].entity_type) {
            Some(field) => field.to_string(),
            None => {
                self.entities[idx].parent = Some(None);
                return Ok(None);
            }
        };

        if !self.entities[idx].has(&field) {
            self.fetch(entity, &[field.as_str()], false)?;
        }

        let parent = match self.entities[idx].fields.get(&field) {
            Some(Value::Entity(parent)) => Some(*parent),
            Some(_) => None,
            None => return Ok(None),
        };
        self.entities[idx].parent = Some(parent);
        Ok(parent)
    }

    /// Fetch the parent fields of several entities, one batched round trip
    /// per hierarchy level
    pub fn fetch_parents(&mut self, entities: &[Entity]) -> Result<(), SessionError> {
        let mut level: Vec<Entity> = entities.to_vec();
        let mut seen: HashSet<Entity> = HashSet::new();

        while !level.is_empty() {
            let mut requests = Vec::new();
            for &entity in &level {
                let idx = self.check(entity)?;
                if !seen.insert(entity) {
                    continue;
                }
                let data = &self.entities[idx];
                if let (Some(field), Some(id)) =
                    (self.parent_fields.field_for(&data.entity_type), data.id)
                {
                    if !data.has(field) {
                        requests.push(FetchRequest {
                            entity_type: data.entity_type.clone(),
                            id,
                            fields: vec![field.to_string()],
                        });
                    }
                }
            }

            if !requests.is_empty() {
                if let Some(store) = self.store.as_deref() {
                    let records = store.fetch(&requests)?;
                    for record in &records {
                        self.merge_record(record)?;
                    }
                }
            }

            let mut next = Vec::new();
            for &entity in &level {
                let data = &self.entities[entity.index()];
                if let Some(field) = self.parent_fields.field_for(&data.entity_type) {
                    if let Some(Value::Entity(parent)) = data.get(field) {
                        if !seen.contains(parent) {
                            next.push(*parent);
                        }
                    }
                }
            }
            level = next;
        }

        Ok(())
    }

    // =========================================================================
    // Record store operations
    // =========================================================================

    /// Fetch fields for an entity; a no-op when they are all known, unless forced
    pub fn fetch(&mut self, entity: Entity, fields: &[&str], force: bool) -> Result<(), SessionError> {
        let idx = self.check(entity)?;
        let data = &self.entities[idx];

        let wanted: Vec<String> = fields
            .iter()
            .filter(|f| force || !data.has(f))
            .map(|f| f.to_string())
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        let Some(id) = data.id else {
            return Ok(());
        };
        let request = FetchRequest {
            entity_type: data.entity_type.clone(),
            id,
            fields: wanted,
        };

        let records = match self.store.as_deref() {
            Some(store) => store.fetch(std::slice::from_ref(&request))?,
            None => return Ok(()),
        };
        for record in &records {
            self.merge_record(record)?;
        }
        Ok(())
    }

    /// Load every field of a saved record
    pub fn load(&mut self, key: &EntityKey) -> Result<Entity, SessionError> {
        let request = FetchRequest {
            entity_type: key.entity_type.clone(),
            id: key.id,
            fields: Vec::new(),
        };
        let records = match self.store.as_deref() {
            Some(store) => store.fetch(std::slice::from_ref(&request))?,
            None => {
                return self.lookup(key).ok_or(SessionError::NoStore);
            }
        };
        for record in &records {
            self.merge_record(record)?;
        }
        self.lookup(key).ok_or_else(|| {
            SessionError::Store(StoreError::NotFound {
                entity_type: key.entity_type.clone(),
                id: key.id,
            })
        })
    }

    /// Load every field of several saved entities in one round trip
    ///
    /// Unsaved entities are skipped; without a store this is a no-op.
    pub fn load_all(&mut self, entities: &[Entity]) -> Result<(), SessionError> {
        let mut requests = Vec::new();
        for &entity in entities {
            let idx = self.check(entity)?;
            let data = &self.entities[idx];
            if let Some(id) = data.id {
                requests.push(FetchRequest {
                    entity_type: data.entity_type.clone(),
                    id,
                    fields: Vec::new(),
                });
            }
        }
        if requests.is_empty() {
            return Ok(());
        }
        let records = match self.store.as_deref() {
            Some(store) => store.fetch(&requests)?,
            None => return Ok(()),
        };
        for record in &records {
            self.merge_record(record)?;
        }
        Ok(())
    }

    pub fn find(
        &mut self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
    ) -> Result<Vec<Entity>, SessionError> {
        let store = self.store.as_deref().ok_or(SessionError::NoStore)?;
        let records = store.find(entity_type, filters, fields)?;
        records.iter().map(|r| self.merge(r.clone())).collect()
    }

    pub fn find_one(
        &mut self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
    ) -> Result<Option<Entity>, SessionError> {
        let store = self.store.as_deref().ok_or(SessionError::NoStore)?;
        match store.find_one(entity_type, filters, fields)? {
            Some(record) => Ok(Some(self.merge(record)?)),
            None => Ok(None),
        }
    }

    pub fn create(&mut self, entity_type: &str, data: Record) -> Result<Entity, SessionError> {
        let store = self.store.as_deref_mut().ok_or(SessionError::NoStore)?;
        let record = store.create(entity_type, data)?;
        self.merge(record)
    }

    pub fn update(&mut self, entity: Entity, data: Record) -> Result<(), SessionError> {
        let key = self
            .key(entity)
            .ok_or_else(|| SessionError::Unsaved(self.describe(entity)))?;
        let store = self.store.as_deref_mut().ok_or(SessionError::NoStore)?;
        let record = store.update(&key.entity_type, key.id, data)?;
        self.merge(record)?;
        Ok(())
    }

    pub fn batch(&mut self, requests: Vec<BatchRequest>) -> Result<Vec<Entity>, SessionError> {
        let store = self.store.as_deref_mut().ok_or(SessionError::NoStore)?;
        let records = store.batch(requests)?;
        records.into_iter().map(|r| self.merge(r)).collect()
    }

    // =========================================================================
    // Presentation
    // =========================================================================

    /// Directory-friendly name: `code`, then `name`, then `Type_id`
    pub fn default_name(&self, entity: Entity) -> String {
        let Some(data) = self.get(entity) else {
            return String::new();
        };
        for field in ["code", "name"] {
            match data.get(field) {
                Some(Value::Str(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Int(i)) => return i.to_string(),
                _ => {}
            }
        }
        match data.id {
            Some(id) => format!("{}_{}", data.entity_type, id),
            None => data.entity_type.clone(),
        }
    }

    /// Human readable label such as `Shot:12 (AA_001)`
    pub fn describe(&self, entity: Entity) -> String {
        let Some(data) = self.get(entity) else {
            return "<foreign entity>".to_string();
        };
        let label = match data.id {
            Some(id) => format!("{}:{}", data.entity_type, id),
            None => format!("{}:new", data.entity_type),
        };
        for field in ["code", "name"] {
            if let Some(Value::Str(s)) = data.get(field) {
                return format!("{} ({})", label, s);
            }
        }
        label
    }

    /// Export an entity as a plain record
    ///
    /// Nested entities are reduced to `{type, id}` plus their `code`/`name`.
    pub fn to_json(&self, entity: Entity) -> Record {
        let mut record = Map::new();
        let Some(data) = self.get(entity) else {
            return record;
        };
        record.insert("type".into(), JsonValue::String(data.entity_type.clone()));
        record.insert("id".into(), data.id.map(JsonValue::from).unwrap_or(JsonValue::Null));
        for (name, value) in &data.fields {
            record.insert(name.clone(), self.value_to_json(value));
        }
        record
    }

    /// Minimal `{type, id, code, name}` form of an entity
    pub fn to_link(&self, entity: Entity) -> Record {
        let mut record = Map::new();
        let Some(data) = self.get(entity) else {
            return record;
        };
        record.insert("type".into(), JsonValue::String(data.entity_type.clone()));
        record.insert("id".into(), data.id.map(JsonValue::from).unwrap_or(JsonValue::Null));
        for field in ["code", "name"] {
            if let Some(Value::Str(s)) = data.get(field) {
                record.insert(field.into(), JsonValue::String(s.clone()));
            }
        }
        record
    }

    /// Link form written into directory tags
    ///
    /// Adds the parent field as a link so a context can be rebuilt from
    /// tags alone, without a record store.
    pub fn to_tag(&self, entity: Entity) -> Record {
        let mut record = self.to_link(entity);
        let Some(data) = self.get(entity) else {
            return record;
        };
        if let Some(field) = self.parent_fields.field_for(&data.entity_type) {
            if let Some(Value::Entity(parent)) = data.get(field) {
                record.insert(field.to_string(), JsonValue::Object(self.to_link(*parent)));
            }
        }
        record
    }

    pub fn value_to_json(&self, value: &Value) -> JsonValue {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => Number::from_f64(*f).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Entity(e) => JsonValue::Object(self.to_link(*e)),
            Value::List(items) => JsonValue::Array(items.iter().map(|v| self.value_to_json(v)).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.value_to_json(v)))
                    .collect(),
            ),
        }
    }
}

/// The record if `value` is entity-shaped (an object with a string `type`)
fn entity_shape(value: &JsonValue) -> Option<&Record> {
    let obj = value.as_object()?;
    obj.get("type")?.as_str()?;
    Some(obj)
}

/// Parse an id, tolerating numeric strings
fn parse_id(value: Option<&JsonValue>) -> Result<Option<i64>, SessionError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| SessionError::InvalidId(n.to_string())),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| SessionError::InvalidId(s.clone())),
        Some(other) => Err(SessionError::InvalidId(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MemoryStore;
    use serde_json::json;

    fn record(value: JsonValue) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_merge_dedups_by_type_and_id() {
        let mut session = Session::new();
        let a = session.merge(record(json!({"type": "Shot", "id": 1, "code": "AA_001"}))).unwrap();
        let b = session.merge(record(json!({"type": "Shot", "id": 1}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(session.len(), 1);
    }

    #[test]
    fn test_merge_never_drops_fields() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({"type": "Shot", "id": 1, "code": "AA_001", "frames": 24})))
            .unwrap();
        session
            .merge(record(json!({"type": "Shot", "id": 1, "frames": 48, "status": "ip"})))
            .unwrap();

        let data = session.data(shot).unwrap();
        assert_eq!(data.get("code"), Some(&Value::Str("AA_001".into())));
        assert_eq!(data.get("frames"), Some(&Value::Int(48)));
        assert_eq!(data.get("status"), Some(&Value::Str("ip".into())));
    }

    #[test]
    fn test_new_records_are_never_deduplicated() {
        let mut session = Session::new();
        let raw = record(json!({"type": "Shot", "code": "new"}));
        let a = session.merge(raw.clone()).unwrap();
        let b = session.merge(raw).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_nested_entities_are_canonical() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({
                "type": "Shot", "id": 1,
                "sequence": {"type": "Sequence", "id": 5, "code": "AA"}
            })))
            .unwrap();
        let seq = session.lookup(&EntityKey::new("Sequence", 5)).unwrap();
        assert_eq!(session.field(shot, "sequence"), Some(&Value::Entity(seq)));
        assert_eq!(session.default_name(seq), "AA");
    }

    #[test]
    fn test_nested_field_with_different_identity_is_replaced() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({"type": "Shot", "id": 1, "sequence": {"type": "Sequence", "id": 5}})))
            .unwrap();
        session
            .merge(record(json!({"type": "Shot", "id": 1, "sequence": {"type": "Sequence", "id": 6}})))
            .unwrap();
        let seq6 = session.lookup(&EntityKey::new("Sequence", 6)).unwrap();
        assert_eq!(session.field(shot, "sequence"), Some(&Value::Entity(seq6)));
        assert!(session.lookup(&EntityKey::new("Sequence", 5)).is_some());
    }

    #[test]
    fn test_unsaved_nested_entities_merge_in_place() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({"type": "Shot", "id": 1, "meta": {"type": "Note", "a": 1}})))
            .unwrap();
        session
            .merge(record(json!({"type": "Shot", "id": 1, "meta": {"type": "Note", "b": 2}})))
            .unwrap();
        let note = session.field(shot, "meta").unwrap().as_entity().unwrap();
        let data = session.data(note).unwrap();
        assert_eq!(data.get("a"), Some(&Value::Int(1)));
        assert_eq!(data.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_foreign_entity_is_an_ownership_error() {
        let mut first = Session::new();
        let mut second = Session::new();
        let shot = first.merge(record(json!({"type": "Shot", "id": 1}))).unwrap();
        let err = second.merge(shot).unwrap_err();
        assert!(matches!(err, SessionError::Ownership { .. }));
    }

    #[test]
    fn test_string_ids_are_normalized() {
        let mut session = Session::new();
        let a = session.merge(record(json!({"type": "Shot", "id": "7"}))).unwrap();
        let b = session.merge(record(json!({"type": "Shot", "id": 7}))).unwrap();
        assert_eq!(a, b);
        assert!(session.merge(record(json!({"type": "Shot", "id": "x"}))).is_err());
        assert!(matches!(
            session.merge(record(json!({"id": 1}))),
            Err(SessionError::MissingType)
        ));
    }

    #[test]
    fn test_parent_from_known_field() {
        let mut session = Session::new();
        let task = session
            .merge(record(json!({"type": "Task", "id": 3, "entity": {"type": "Shot", "id": 1}})))
            .unwrap();
        let shot = session.lookup(&EntityKey::new("Shot", 1)).unwrap();
        assert_eq!(session.parent(task).unwrap(), Some(shot));
    }

    #[test]
    fn test_parent_of_project_is_none() {
        let mut session = Session::new();
        let project = session.merge(record(json!({"type": "Project", "id": 1}))).unwrap();
        assert_eq!(session.parent(project).unwrap(), None);
    }

    #[test]
    fn test_parent_fetched_from_store() {
        let store = MemoryStore::from_json(json!({
            "Project": [{"id": 1}],
            "Sequence": [{"id": 2, "code": "AA", "project": {"type": "Project", "id": 1}}]
        }))
        .unwrap();
        let mut session = Session::with_store(store);
        let seq = session.merge(record(json!({"type": "Sequence", "id": 2}))).unwrap();
        let project = session.parent(seq).unwrap().unwrap();
        assert_eq!(session.key(project), Some(EntityKey::new("Project", 1)));
    }

    #[test]
    fn test_fetch_parents_walks_levels() {
        let store = MemoryStore::from_json(json!({
            "Project": [{"id": 1}],
            "Sequence": [{"id": 2, "project": {"type": "Project", "id": 1}}],
            "Shot": [{"id": 3, "sequence": {"type": "Sequence", "id": 2}}],
            "Task": [{"id": 4, "entity": {"type": "Shot", "id": 3}}]
        }))
        .unwrap();
        let mut session = Session::with_store(store);
        let task = session.merge(record(json!({"type": "Task", "id": 4}))).unwrap();
        session.fetch_parents(&[task]).unwrap();

        assert!(session.lookup(&EntityKey::new("Project", 1)).is_some());
        let shot = session.lookup(&EntityKey::new("Shot", 3)).unwrap();
        assert!(session.data(shot).unwrap().has("sequence"));
    }

    #[test]
    fn test_fetch_is_noop_when_fields_known() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({"type": "Shot", "id": 1, "code": "AA"})))
            .unwrap();
        session.fetch(shot, &["code"], false).unwrap();
    }

    #[test]
    fn test_load_and_find() {
        let store = MemoryStore::from_json(json!({
            "Shot": [{"id": 1, "code": "AA_001"}, {"id": 2, "code": "AA_002"}]
        }))
        .unwrap();
        let mut session = Session::with_store(store);
        let shot = session.load(&EntityKey::new("Shot", 2)).unwrap();
        assert_eq!(session.default_name(shot), "AA_002");

        let found = session
            .find("Shot", &[Filter::is("code", "AA_001")], &[])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(session.key(found[0]), Some(EntityKey::new("Shot", 1)));
    }

    #[test]
    fn test_load_all_fills_every_field() {
        let store = MemoryStore::from_json(json!({
            "Shot": [{"id": 1, "code": "AA_001", "cut_in": 1001}],
            "Task": [{"id": 2, "content": "Anim", "step": {"type": "Step", "id": 9, "code": "anim"}}]
        }))
        .unwrap();
        let mut session = Session::with_store(store);
        let shot = session.merge(record(json!({"type": "Shot", "id": 1}))).unwrap();
        let task = session.merge(record(json!({"type": "Task", "id": 2}))).unwrap();
        let draft = session.merge(record(json!({"type": "Task", "content": "new"}))).unwrap();

        session.load_all(&[shot, task, draft]).unwrap();
        assert_eq!(session.field(shot, "cut_in"), Some(&Value::Int(1001)));
        let step = session.field(task, "step").and_then(Value::as_entity).unwrap();
        assert_eq!(session.default_name(step), "anim");
    }

    #[test]
    fn test_store_operations_require_store() {
        let mut session = Session::new();
        assert!(matches!(
            session.find("Shot", &[], &[]),
            Err(SessionError::NoStore)
        ));
    }

    #[test]
    fn test_create_and_update_merge_results() {
        let mut session = Session::with_store(MemoryStore::new());
        let shot = session
            .create("Shot", record(json!({"code": "AA_010"})))
            .unwrap();
        assert!(session.key(shot).is_some());

        session.update(shot, record(json!({"status": "fin"}))).unwrap();
        assert_eq!(session.field(shot, "status"), Some(&Value::Str("fin".into())));
        assert_eq!(session.field(shot, "code"), Some(&Value::Str("AA_010".into())));
    }

    #[test]
    fn test_to_json_reduces_nested_entities() {
        let mut session = Session::new();
        let task = session
            .merge(record(json!({
                "type": "Task", "id": 3, "content": "anim",
                "entity": {"type": "Shot", "id": 1, "code": "AA_001", "frames": 10}
            })))
            .unwrap();
        let out = session.to_json(task);
        assert_eq!(out["entity"], json!({"type": "Shot", "id": 1, "code": "AA_001"}));
        assert_eq!(out["content"], "anim");
    }
}
