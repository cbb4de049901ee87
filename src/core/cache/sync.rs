//! Cache synchronization with tag sidecars
//!
//! Rebuilds the index from the ground truth on disk.

use rusqlite::params;

use super::{PathCache, Result, SyncStats};
use crate::core::tags;

impl PathCache {
    /// Full rebuild of the cache from the tag sidecars below the root
    ///
    /// Directories are visited in path order; an entity tagged on several
    /// directories keeps the first one.
    pub fn rebuild(&mut self) -> Result<SyncStats> {
        let start = std::time::Instant::now();
        let mut stats = SyncStats::default();

        let mut dirs = tags::find_tagged_dirs(&self.root);
        dirs.sort();

        let mut rows = Vec::new();
        for dir in &dirs {
            let inside = dir.strip_prefix(&self.root).unwrap_or(dir);
            if inside.components().any(|c| c.as_os_str() == ".tfs") {
                continue;
            }
            stats.dirs_scanned += 1;

            let found = match tags::read_tags(dir) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to read tags");
                    stats.unreadable += 1;
                    continue;
                }
            };

            let rel = self.relative(dir)?;
            for tag in found {
                if let Some(key) = tag.key() {
                    rows.push((key, rel.clone()));
                }
            }
        }

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM entity_paths", [])?;
        for (key, rel) in rows {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO entity_paths (entity_type, entity_id, path) VALUES (?1, ?2, ?3)",
                params![key.entity_type, key.id, rel],
            )?;
            if inserted == 0 {
                stats.duplicates += 1;
            } else {
                stats.entries_indexed += 1;
            }
        }
        tx.commit()?;

        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            dirs = stats.dirs_scanned,
            entries = stats.entries_indexed,
            "rebuilt path cache"
        );
        Ok(stats)
    }
}
