//! Database schema initialization

use rusqlite::params;

use super::{PathCache, Result, SCHEMA_VERSION};

impl PathCache {
    /// Initialize database schema
    pub(super) fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            -- Entity identity to root-relative directory
            CREATE TABLE IF NOT EXISTS entity_paths (
                entity_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                UNIQUE (entity_type, entity_id)
            );
            CREATE INDEX IF NOT EXISTS idx_entity_paths_path ON entity_paths(path);
            "#,
        )?;

        self.conn.execute("DELETE FROM schema_version", [])?;
        self.conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;

        Ok(())
    }
}
