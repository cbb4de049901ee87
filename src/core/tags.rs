//! Directory tag sidecars
//!
//! A tagged directory carries a `.tfs-tags.yaml` file listing the entities it
//! represents. Tags are the ground truth for entity ↔ directory mapping; the
//! path cache only accelerates lookups and is always re-verified against them.
//!
//! ```yaml
//! - entity:
//!     type: Shot
//!     id: 1042
//!     code: AA_010
//!   created_at: 2024-03-01T12:00:00Z
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use walkdir::WalkDir;

use crate::core::entity::{Entity, EntityKey};
use crate::core::session::{Session, SessionError};
use crate::core::store::Record;

/// Sidecar file name inside a tagged directory
pub const TAG_FILE: &str = ".tfs-tags.yaml";

/// Errors reading or writing tag sidecars
#[derive(Debug, Error)]
pub enum TagError {
    #[error("failed to access tags in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed tag file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("cannot tag with a record lacking type or id: {0}")]
    InvalidEntity(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One attestation that a directory represents an entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tag {
    pub entity: Record,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn key(&self) -> Option<EntityKey> {
        let entity_type = self.entity.get("type")?.as_str()?;
        let id = self.entity.get("id")?.as_i64()?;
        Some(EntityKey::new(entity_type, id))
    }

    pub fn is_for(&self, key: &EntityKey) -> bool {
        self.key().as_ref() == Some(key)
    }
}

/// Path of the sidecar for a directory
pub fn tag_path(dir: &Path) -> PathBuf {
    dir.join(TAG_FILE)
}

/// Read and normalize the tags of a directory
///
/// A directory without a sidecar has no tags. Entries that cannot be
/// normalized are skipped with a warning.
pub fn read_tags(dir: &Path) -> Result<Vec<Tag>, TagError> {
    let path = tag_path(dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(_) if !dir.is_dir() => return Ok(Vec::new()),
        Err(source) => return Err(TagError::Io { path, source }),
    };

    let doc: JsonValue = serde_yml::from_str(&content).map_err(|e| TagError::Parse {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let items = match doc {
        JsonValue::Null => return Ok(Vec::new()),
        JsonValue::Array(items) => items,
        // A lone mapping is a single tag
        JsonValue::Object(_) => vec![doc],
        _ => {
            return Err(TagError::Parse {
                path,
                message: "expected a list of tags".to_string(),
            })
        }
    };

    let mut tags = Vec::with_capacity(items.len());
    for item in items {
        match normalize_tag(&item) {
            Some(tag) => tags.push(tag),
            None => tracing::warn!(path = %path.display(), "skipping unreadable tag entry"),
        }
    }
    Ok(tags)
}

/// Whether a directory carries a tag for the entity
pub fn has_tag(dir: &Path, key: &EntityKey) -> Result<bool, TagError> {
    Ok(read_tags(dir)?.iter().any(|t| t.is_for(key)))
}

/// Append a tag for `entity` to a directory's sidecar
///
/// Existing tags are preserved. Returns `false` without writing when the
/// directory is already tagged with this entity.
pub fn add_tag(dir: &Path, entity: &Record) -> Result<bool, TagError> {
    let tag = Tag {
        entity: normalize_entity(entity)
            .ok_or_else(|| TagError::InvalidEntity(JsonValue::Object(entity.clone()).to_string()))?,
        created_at: Utc::now(),
    };
    let key = tag
        .key()
        .ok_or_else(|| TagError::InvalidEntity(JsonValue::Object(entity.clone()).to_string()))?;

    let mut tags = read_tags(dir)?;
    if tags.iter().any(|t| t.is_for(&key)) {
        return Ok(false);
    }
    tags.push(tag);
    write_tags(dir, &tags)?;
    tracing::debug!(dir = %dir.display(), entity = %key, "tagged directory");
    Ok(true)
}

/// Remove every tag for an entity; returns the number removed
pub fn remove_tag(dir: &Path, key: &EntityKey) -> Result<usize, TagError> {
    let mut tags = read_tags(dir)?;
    let before = tags.len();
    tags.retain(|t| !t.is_for(key));
    let removed = before - tags.len();
    if removed > 0 {
        write_tags(dir, &tags)?;
    }
    Ok(removed)
}

fn write_tags(dir: &Path, tags: &[Tag]) -> Result<(), TagError> {
    let path = tag_path(dir);
    let yaml = serde_yml::to_string(tags).map_err(|e| TagError::Parse {
        path: path.clone(),
        message: e.to_string(),
    })?;
    fs::write(&path, yaml).map_err(|source| TagError::Io { path, source })
}

/// Every directory under `root` that carries a tag sidecar
pub fn find_tagged_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == TAG_FILE)
        .filter_map(|e| e.path().parent().map(Path::to_path_buf))
        .collect()
}

/// Entities tagged on `path` and its ancestors, nearest first
///
/// Every tagged entity is merged into the session. An entity tagged on
/// several levels is reported once, at its nearest level.
pub fn entities_from_path(session: &mut Session, path: &Path) -> Result<Vec<Entity>, TagError> {
    let start = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut found: Vec<Entity> = Vec::new();

    for dir in start.ancestors() {
        for tag in read_tags(dir)? {
            let entity = session.merge(tag.entity)?;
            if !found.contains(&entity) {
                found.push(entity);
            }
        }
    }
    Ok(found)
}

fn normalize_tag(item: &JsonValue) -> Option<Tag> {
    let obj = item.as_object()?;
    let entity = match obj.get("entity") {
        Some(JsonValue::Object(entity)) => normalize_entity(entity)?,
        // Legacy: entity keys stored beside the timestamp
        _ => normalize_entity(obj)?,
    };
    let created_at = obj
        .get("created_at")
        .or_else(|| obj.get("created"))
        .and_then(parse_timestamp)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    Some(Tag { entity, created_at })
}

/// Canonical `{type, id, ...}` form of a tagged entity record
fn normalize_entity(raw: &Record) -> Option<Record> {
    let entity_type = raw
        .get("type")
        .or_else(|| raw.get("entity_type"))?
        .as_str()?
        .to_string();
    let id = match raw.get("id").or_else(|| raw.get("entity_id"))? {
        JsonValue::Number(n) => n.as_i64()?,
        JsonValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };

    let mut entity = Record::new();
    entity.insert("type".into(), JsonValue::String(entity_type));
    entity.insert("id".into(), JsonValue::from(id));
    for (k, v) in raw {
        if matches!(k.as_str(), "type" | "id" | "entity_type" | "entity_id" | "created_at" | "created") {
            continue;
        }
        entity.insert(k.clone(), v.clone());
    }
    Some(entity)
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]` (UTC) and Unix epoch seconds
fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => {
            if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                let f = n.as_f64()?;
                let secs = f.trunc() as i64;
                let nanos = ((f - f.trunc()) * 1e9).round() as u32;
                Utc.timestamp_opt(secs, nanos.min(999_999_999)).single()
            }
        }
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(naive.and_utc());
                }
            }
            s.parse::<f64>().ok().and_then(|f| parse_timestamp(&JsonValue::from(f)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn shot(id: i64) -> Record {
        json!({"type": "Shot", "id": id, "code": format!("AA_{:03}", id)})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_untagged_directory_has_no_tags() {
        let tmp = tempdir().unwrap();
        assert!(read_tags(tmp.path()).unwrap().is_empty());
        assert!(!has_tag(tmp.path(), &EntityKey::new("Shot", 1)).unwrap());
    }

    #[test]
    fn test_add_tag_preserves_existing() {
        let tmp = tempdir().unwrap();
        assert!(add_tag(tmp.path(), &shot(1)).unwrap());
        assert!(add_tag(tmp.path(), &shot(2)).unwrap());

        let tags = read_tags(tmp.path()).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].key(), Some(EntityKey::new("Shot", 1)));
        assert_eq!(tags[1].entity["code"], "AA_002");
    }

    #[test]
    fn test_add_tag_is_idempotent() {
        let tmp = tempdir().unwrap();
        assert!(add_tag(tmp.path(), &shot(1)).unwrap());
        assert!(!add_tag(tmp.path(), &shot(1)).unwrap());
        assert_eq!(read_tags(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_add_tag_requires_identity() {
        let tmp = tempdir().unwrap();
        let record = json!({"type": "Shot"}).as_object().unwrap().clone();
        assert!(matches!(
            add_tag(tmp.path(), &record),
            Err(TagError::InvalidEntity(_))
        ));
    }

    #[test]
    fn test_legacy_encodings_are_normalized() {
        let tmp = tempdir().unwrap();
        fs::write(
            tag_path(tmp.path()),
            r#"
- entity: {type: Shot, id: "12"}
  created_at: 1700000000
- entity: {entity_type: Task, entity_id: 7}
  created_at: "2023-11-14 22:13:20"
- entity: {type: Asset, id: 3}
  created_at: 1700000000.5
- entity_type: Sequence
  entity_id: "4"
  created_at: "2023-11-14T22:13:20Z"
"#,
        )
        .unwrap();

        let tags = read_tags(tmp.path()).unwrap();
        assert_eq!(tags.len(), 4);
        assert_eq!(tags[0].key(), Some(EntityKey::new("Shot", 12)));
        assert_eq!(tags[1].key(), Some(EntityKey::new("Task", 7)));
        assert_eq!(tags[3].key(), Some(EntityKey::new("Sequence", 4)));
        assert_eq!(tags[0].created_at, tags[1].created_at);
        assert_eq!(tags[0].created_at, tags[3].created_at);
        assert_eq!(tags[2].created_at.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_remove_tag() {
        let tmp = tempdir().unwrap();
        add_tag(tmp.path(), &shot(1)).unwrap();
        add_tag(tmp.path(), &shot(2)).unwrap();
        assert_eq!(remove_tag(tmp.path(), &EntityKey::new("Shot", 1)).unwrap(), 1);
        assert!(!has_tag(tmp.path(), &EntityKey::new("Shot", 1)).unwrap());
        assert!(has_tag(tmp.path(), &EntityKey::new("Shot", 2)).unwrap());
    }

    #[test]
    fn test_find_tagged_dirs() {
        let tmp = tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("a/b/c");
        fs::create_dir_all(&b).unwrap();
        add_tag(&a, &shot(1)).unwrap();
        add_tag(&b, &shot(2)).unwrap();

        let mut dirs = find_tagged_dirs(tmp.path());
        dirs.sort();
        assert_eq!(dirs, vec![a, b]);
    }

    #[test]
    fn test_entities_from_path_nearest_first() {
        let tmp = tempdir().unwrap();
        let seq_dir = tmp.path().join("SEQ/AA");
        let shot_dir = seq_dir.join("AA_001");
        fs::create_dir_all(shot_dir.join("work")).unwrap();

        let seq = json!({"type": "Sequence", "id": 5, "code": "AA"}).as_object().unwrap().clone();
        add_tag(&seq_dir, &seq).unwrap();
        add_tag(&shot_dir, &shot(1)).unwrap();

        let mut session = Session::new();
        let found = entities_from_path(&mut session, &shot_dir.join("work")).unwrap();
        let keys: Vec<_> = found.iter().map(|&e| session.key(e).unwrap()).collect();
        assert_eq!(keys, vec![EntityKey::new("Shot", 1), EntityKey::new("Sequence", 5)]);
    }
}
