//! SQLite-backed path cache
//!
//! Maps entity identity `(type, id)` to a directory path relative to the
//! project root. The cache is an accelerator only: every hit is re-verified
//! against the tag sidecar of the directory it names, and a row whose
//! directory no longer attests the entity is reported as a miss.
//!
//! The cache is local to one machine and never authoritative. Stale rows are
//! left in place for `tfs cache rebuild` to reconcile.

mod schema;
mod sync;
mod types;

pub use types::*;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::core::entity::{Entity, EntityKey};
use crate::core::project::Project;
use crate::core::session::{Session, SessionError};
use crate::core::tags::{self, TagError};

/// Cache file location within a project
pub const CACHE_FILE: &str = ".tfs/cache.db";

/// Current schema version - cache is reinitialized on version mismatch
const SCHEMA_VERSION: i32 = 1;

/// Errors raised by the path cache
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    #[diagnostic(code(tfs::cache::sqlite))]
    Sqlite(#[from] rusqlite::Error),

    #[error("cache I/O error: {0}")]
    #[diagnostic(code(tfs::cache::io))]
    Io(#[from] std::io::Error),

    #[error("{path} is outside the project root {root}")]
    #[diagnostic(
        code(tfs::cache::outside_root),
        help("only directories below the project root can be cached")
    )]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error(transparent)]
    #[diagnostic(code(tfs::cache::tag))]
    Tag(#[from] TagError),

    #[error(transparent)]
    #[diagnostic(code(tfs::cache::session))]
    Session(#[from] SessionError),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// The path cache of one project root
pub struct PathCache {
    conn: Connection,
    root: PathBuf,
}

impl std::fmt::Debug for PathCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCache").field("root", &self.root).finish()
    }
}

impl PathCache {
    /// Open or create the cache of a project
    pub fn open(project: &Project) -> Result<Self> {
        Self::open_at(project.root())
    }

    /// Open or create the cache for an arbitrary root directory
    pub fn open_at(root: &Path) -> Result<Self> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let cache_path = root.join(CACHE_FILE);

        if let Some(parent) = cache_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let needs_init = !cache_path.exists();
        let conn = Connection::open(&cache_path)?;
        if needs_init {
            // Project roots are shared between users
            set_world_writable(&cache_path)?;
        }

        // WAL lets readers proceed while a writer holds a transaction
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let mut cache = Self { conn, root };

        if needs_init {
            cache.init_schema()?;
        } else if cache.needs_schema_rebuild()? {
            cache.reinitialize_schema()?;
        }

        tracing::debug!(path = %cache_path.display(), "opened path cache");
        Ok(cache)
    }

    /// Project root this cache indexes
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn needs_schema_rebuild(&self) -> Result<bool> {
        let current_version: i32 = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        Ok(current_version != SCHEMA_VERSION)
    }

    fn reinitialize_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS schema_version;
            DROP TABLE IF EXISTS entity_paths;
            "#,
        )?;
        self.init_schema()
    }

    /// Root-relative form of `path` using `/` separators
    ///
    /// Relative paths are taken relative to the root.
    pub fn relative(&self, path: &Path) -> Result<String> {
        let absolute = if path.is_absolute() {
            resolve(path)
        } else {
            resolve(&self.root.join(path))
        };

        let rel = absolute
            .strip_prefix(&self.root)
            .map_err(|_| CacheError::OutsideRoot {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })?;

        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"))
    }

    /// Absolute form of a stored relative path
    pub fn absolute(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Record the directory of an entity, replacing any previous row
    pub fn put(&mut self, key: &EntityKey, path: &Path) -> Result<()> {
        let rel = self.relative(path)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO entity_paths (entity_type, entity_id, path)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET path = excluded.path
            "#,
            params![key.entity_type, key.id, rel],
        )?;
        tx.commit()?;

        tracing::debug!(entity = %key, path = %rel, "cached entity path");
        Ok(())
    }

    /// The stored path of an entity, without tag verification
    pub fn cached_path(&self, key: &EntityKey) -> Result<Option<PathBuf>> {
        let rel: Option<String> = self
            .conn
            .query_row(
                "SELECT path FROM entity_paths WHERE entity_type = ?1 AND entity_id = ?2",
                params![key.entity_type, key.id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(rel.map(|rel| self.absolute(&rel)))
    }

    /// Verified absolute path of an entity
    ///
    /// Returns `None` when there is no row, or when the directory the row
    /// names no longer carries a tag for this entity. Stale rows are kept.
    pub fn get(&self, key: &EntityKey) -> Result<Option<PathBuf>> {
        let Some(path) = self.cached_path(key)? else {
            return Ok(None);
        };

        match tags::has_tag(&path, key) {
            Ok(true) => Ok(Some(path)),
            Ok(false) => {
                tracing::debug!(entity = %key, path = %path.display(), "stale cache row");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(entity = %key, path = %path.display(), error = %e, "cannot verify cache row");
                Ok(None)
            }
        }
    }

    /// Remove the row of an entity; returns whether a row existed
    pub fn delete(&mut self, key: &EntityKey) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM entity_paths WHERE entity_type = ?1 AND entity_id = ?2",
            params![key.entity_type, key.id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Every row, ordered by path
    pub fn entries(&self) -> Result<Vec<CachedPath>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, entity_id, path FROM entity_paths ORDER BY path, entity_type, entity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CachedPath {
                key: EntityKey::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)?),
                path: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// All cached entities, merged into the session
    pub fn iter(&self, session: &mut Session) -> Result<Vec<Entity>> {
        self.entries()?
            .into_iter()
            .map(|entry| Ok(session.merge(entry.key_record())?))
            .collect()
    }

    /// Cached `(path, entity)` pairs at or below `sub_path`
    ///
    /// `entity_type` restricts the result to one type. With `fresh`, rows
    /// whose directory no longer exists are left out.
    pub fn walk(
        &self,
        session: &mut Session,
        sub_path: &Path,
        entity_type: Option<&str>,
        fresh: bool,
    ) -> Result<Vec<(PathBuf, Entity)>> {
        let sub = self.relative(sub_path)?;
        let sub = Path::new(&sub);

        let mut out = Vec::new();
        for entry in self.entries()? {
            if entity_type.is_some_and(|t| t != entry.key.entity_type) {
                continue;
            }
            if !Path::new(&entry.path).starts_with(sub) {
                continue;
            }
            let path = self.absolute(&entry.path);
            if fresh && !path.is_dir() {
                continue;
            }
            let entity = session.merge(entry.key_record())?;
            out.push((path, entity));
        }
        Ok(out)
    }

    /// Row counts by entity type
    pub fn statistics(&self) -> Result<CacheStats> {
        let total_entries: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM entity_paths", [], |row| row.get(0))?;

        let mut by_type = BTreeMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT entity_type, COUNT(*) FROM entity_paths GROUP BY entity_type")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, usize>(1)?))
            })?;
            for row in rows {
                let (entity_type, count) = row?;
                by_type.insert(entity_type, count);
            }
        }

        let db_path = self.root.join(CACHE_FILE);
        let db_size_bytes = fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

        Ok(CacheStats {
            total_entries,
            by_type,
            db_size_bytes,
        })
    }

    /// Remove every row
    pub fn clear(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entity_paths", [])?;
        tx.commit()?;
        Ok(())
    }
}

/// Lexically resolve `.` and `..` in a path that may not exist yet
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest existing prefix of `path`, keeping the rest
fn resolve(path: &Path) -> PathBuf {
    let path = normalize(path);
    for ancestor in path.ancestors() {
        if let Ok(real) = ancestor.canonicalize() {
            return match path.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
                _ => real,
            };
        }
    }
    path
}

#[cfg(unix)]
fn set_world_writable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
}

#[cfg(not(unix))]
fn set_world_writable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests;
