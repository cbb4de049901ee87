//! Structure processors
//!
//! A processor receives the filesystem operations of a rendered structure.
//! [`FsProcessor`] performs them, [`DryRunProcessor`] only records them.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::cache::{CacheError, PathCache};
use crate::core::entity::EntityKey;
use crate::core::store::Record;
use crate::core::tags::{self, TagError};

/// Errors raised while processing a structure
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Receiver of filesystem operations
pub trait Processor {
    fn mkdir(&mut self, path: &Path) -> Result<(), ProcessError>;
    fn touch(&mut self, path: &Path) -> Result<(), ProcessError>;
    fn copy(&mut self, source: &Path, target: &Path) -> Result<(), ProcessError>;
    /// Attest that `path` belongs to the entity
    fn tag(&mut self, path: &Path, key: &EntityKey, entity: &Record) -> Result<(), ProcessError>;
}

/// Counts of operations that changed something on disk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub dirs_created: usize,
    pub files_touched: usize,
    pub files_copied: usize,
    pub tags_added: usize,
    pub cache_updates: usize,
}

impl ProcessStats {
    /// Filesystem mutations, excluding cache index updates
    pub fn mutations(&self) -> usize {
        self.dirs_created + self.files_touched + self.files_copied + self.tags_added
    }
}

/// Performs operations for real, creating only what is absent
pub struct FsProcessor<'a> {
    verbose: bool,
    cache: Option<&'a mut PathCache>,
    stats: ProcessStats,
}

impl<'a> FsProcessor<'a> {
    pub fn new() -> Self {
        Self {
            verbose: false,
            cache: None,
            stats: ProcessStats::default(),
        }
    }

    /// Log every mutation at info level
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Index tagged entity directories in a path cache
    pub fn with_cache(mut self, cache: &'a mut PathCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn stats(&self) -> ProcessStats {
        self.stats
    }

    fn log(&self, action: &str, path: &Path) {
        if self.verbose {
            tracing::info!(path = %path.display(), "{}", action);
        } else {
            tracing::debug!(path = %path.display(), "{}", action);
        }
    }
}

impl Default for FsProcessor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error<'p>(action: &'static str, path: &'p Path) -> impl FnOnce(io::Error) -> ProcessError + 'p {
    move |source| ProcessError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

impl Processor for FsProcessor<'_> {
    fn mkdir(&mut self, path: &Path) -> Result<(), ProcessError> {
        if path.is_dir() {
            return Ok(());
        }
        match fs::create_dir_all(path) {
            Ok(()) => {}
            // Another process got there first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(()),
            Err(e) => return Err(io_error("create directory", path)(e)),
        }
        self.stats.dirs_created += 1;
        self.log("mkdir", path);
        Ok(())
    }

    fn touch(&mut self, path: &Path) -> Result<(), ProcessError> {
        if path.exists() {
            return Ok(());
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(io_error("create file", path)(e)),
        }
        self.stats.files_touched += 1;
        self.log("touch", path);
        Ok(())
    }

    fn copy(&mut self, source: &Path, target: &Path) -> Result<(), ProcessError> {
        if target.exists() {
            return Ok(());
        }
        fs::copy(source, target).map_err(io_error("copy template to", target))?;
        self.stats.files_copied += 1;
        self.log("copy", target);
        Ok(())
    }

    fn tag(&mut self, path: &Path, key: &EntityKey, entity: &Record) -> Result<(), ProcessError> {
        if tags::add_tag(path, entity)? {
            self.stats.tags_added += 1;
            if self.verbose {
                tracing::info!(path = %path.display(), entity = %key, "tag");
            }
        }
        if let Some(cache) = self.cache.as_deref_mut() {
            if cache.cached_path(key)?.as_deref() != Some(path) {
                cache.put(key, path)?;
                self.stats.cache_updates += 1;
            }
        }
        Ok(())
    }
}

/// An operation recorded by [`DryRunProcessor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mkdir(PathBuf),
    Touch(PathBuf),
    Copy { source: PathBuf, target: PathBuf },
    Tag { path: PathBuf, key: EntityKey },
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Mkdir(path) => write!(f, "mkdir {}", path.display()),
            Operation::Touch(path) => write!(f, "touch {}", path.display()),
            Operation::Copy { source, target } => {
                write!(f, "copy  {} <- {}", target.display(), source.display())
            }
            Operation::Tag { path, key } => write!(f, "tag   {} as {}", path.display(), key),
        }
    }
}

/// Records operations without touching the filesystem
#[derive(Debug, Default)]
pub struct DryRunProcessor {
    operations: Vec<Operation>,
    made: HashSet<PathBuf>,
}

impl DryRunProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}

impl Processor for DryRunProcessor {
    fn mkdir(&mut self, path: &Path) -> Result<(), ProcessError> {
        if self.made.insert(path.to_path_buf()) {
            self.operations.push(Operation::Mkdir(path.to_path_buf()));
        }
        Ok(())
    }

    fn touch(&mut self, path: &Path) -> Result<(), ProcessError> {
        self.operations.push(Operation::Touch(path.to_path_buf()));
        Ok(())
    }

    fn copy(&mut self, source: &Path, target: &Path) -> Result<(), ProcessError> {
        self.operations.push(Operation::Copy {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn tag(&mut self, path: &Path, key: &EntityKey, _entity: &Record) -> Result<(), ProcessError> {
        self.operations.push(Operation::Tag {
            path: path.to_path_buf(),
            key: key.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn shot() -> (EntityKey, Record) {
        let record = json!({"type": "Shot", "id": 1, "code": "AA_010"})
            .as_object()
            .unwrap()
            .clone();
        (EntityKey::new("Shot", 1), record)
    }

    #[test]
    fn test_fs_processor_creates_once() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("a/b");
        let file = dir.join("notes.txt");
        let (key, record) = shot();

        let mut processor = FsProcessor::new();
        processor.mkdir(&dir).unwrap();
        processor.touch(&file).unwrap();
        processor.tag(&dir, &key, &record).unwrap();
        assert_eq!(processor.stats().mutations(), 3);

        processor.mkdir(&dir).unwrap();
        processor.touch(&file).unwrap();
        processor.tag(&dir, &key, &record).unwrap();
        assert_eq!(processor.stats().mutations(), 3);
        assert!(tags::has_tag(&dir, &key).unwrap());
    }

    #[test]
    fn test_copy_keeps_existing_target() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("template.txt");
        let target = tmp.path().join("copy.txt");
        fs::write(&source, "template").unwrap();

        let mut processor = FsProcessor::new();
        processor.copy(&source, &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "template");

        fs::write(&target, "edited").unwrap();
        processor.copy(&source, &target).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "edited");
        assert_eq!(processor.stats().files_copied, 1);
    }

    #[test]
    fn test_fs_processor_indexes_tags() {
        let tmp = TempDir::new().unwrap();
        let mut cache = PathCache::open_at(tmp.path()).unwrap();
        let dir = cache.root().join("SEQ/AA/AA_010");
        let (key, record) = shot();

        {
            let mut processor = FsProcessor::new().with_cache(&mut cache);
            processor.mkdir(&dir).unwrap();
            processor.tag(&dir, &key, &record).unwrap();
            assert_eq!(processor.stats().cache_updates, 1);
        }
        assert_eq!(cache.get(&key).unwrap(), Some(dir.clone()));

        let mut processor = FsProcessor::new().with_cache(&mut cache);
        processor.tag(&dir, &key, &record).unwrap();
        assert_eq!(processor.stats().cache_updates, 0);
    }

    #[test]
    fn test_io_errors_propagate() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();

        let mut processor = FsProcessor::new();
        let err = processor.mkdir(&blocker.join("child")).unwrap_err();
        assert!(matches!(err, ProcessError::Io { .. }));

        let missing = tmp.path().join("missing/notes.txt");
        let err = processor.touch(&missing).unwrap_err();
        assert!(
            matches!(&err, ProcessError::Io { action: "create file", path, .. } if *path == missing),
            "{err}"
        );

        let err = processor
            .copy(&tmp.path().join("no-template"), &tmp.path().join("copy.txt"))
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to copy template to"), "{err}");
        assert_eq!(processor.stats().mutations(), 0);
    }

    #[test]
    fn test_dry_run_records_and_dedups() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("never");
        let (key, record) = shot();

        let mut dry = DryRunProcessor::new();
        dry.mkdir(&dir).unwrap();
        dry.mkdir(&dir).unwrap();
        dry.touch(&dir.join("f")).unwrap();
        dry.tag(&dir, &key, &record).unwrap();

        assert_eq!(dry.operations().len(), 3);
        assert_eq!(dry.operations()[0], Operation::Mkdir(dir.clone()));
        assert!(!dir.exists());
    }
}
