//! Configuration management with layered hierarchy

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::hierarchy::ParentFields;
use crate::core::Project;

/// Schema used when nothing is configured
pub const DEFAULT_SCHEMA: &str = "default";

/// Template entries that never become schema nodes
const DEFAULT_TEMPLATE_IGNORE: [&str; 3] = [".DS_Store", "Thumbs.db", ".gitkeep"];

/// TFS configuration with layered hierarchy
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema name, optionally pinned as `name@vN`
    pub schema: Option<String>,

    /// Extra directories searched for schemas, in order
    pub schema_paths: Vec<PathBuf>,

    /// Records file backing the local record store
    pub records: Option<PathBuf>,

    /// Template entries skipped when scanning template directories
    pub template_ignore: Option<Vec<String>>,

    /// Extra or overridden parent fields by entity type
    pub parent_fields: BTreeMap<String, Option<String>>,

    /// Log every filesystem operation
    pub verbose: Option<bool>,
}

impl Config {
    /// Load configuration from all sources, merging in priority order
    pub fn load() -> Self {
        let project = Project::discover().ok();
        Self::load_for(project.as_ref())
    }

    /// Load configuration for a known project (or none)
    pub fn load_for(project: Option<&Project>) -> Self {
        let mut config = Config::default();

        // 1. Built-in defaults (already in Default impl)

        // 2. Global user config (~/.config/tfs/config.yaml)
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::read(&global_path) {
                config.merge(global);
            }
        }

        // 3. Project config (.tfs/config.yaml); relative paths are taken
        // relative to the project root
        if let Some(project) = project {
            if let Some(mut project_config) = Self::read(&project.config_path()) {
                project_config.anchor(project.root());
                config.merge(project_config);
            }
        }

        // 4. Environment variables
        if let Ok(schema) = std::env::var("TFS_SCHEMA") {
            config.schema = Some(schema);
        }
        if let Some(paths) = std::env::var_os("TFS_SCHEMA_PATH") {
            let mut env_paths: Vec<PathBuf> = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            env_paths.append(&mut config.schema_paths);
            config.schema_paths = env_paths;
        }
        if let Some(records) = std::env::var_os("TFS_RECORDS") {
            config.records = Some(PathBuf::from(records));
        }

        config
    }

    fn read(path: &Path) -> Option<Config> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_yml::from_str::<Config>(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                None
            }
        }
    }

    /// Get the path to the global config file
    fn global_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tfs")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// User cache directory, where bundled schemas are materialized
    pub fn cache_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tfs").map(|dirs| dirs.cache_dir().to_path_buf())
    }

    fn anchor(&mut self, root: &Path) {
        for path in &mut self.schema_paths {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
        if let Some(records) = &mut self.records {
            if records.is_relative() {
                *records = root.join(&*records);
            }
        }
    }

    /// Merge another config into this one (other takes precedence)
    fn merge(&mut self, other: Config) {
        if other.schema.is_some() {
            self.schema = other.schema;
        }
        if !other.schema_paths.is_empty() {
            // Later layers are searched first
            let mut paths = other.schema_paths;
            paths.append(&mut self.schema_paths);
            self.schema_paths = paths;
        }
        if other.records.is_some() {
            self.records = other.records;
        }
        if other.template_ignore.is_some() {
            self.template_ignore = other.template_ignore;
        }
        self.parent_fields.extend(other.parent_fields);
        if other.verbose.is_some() {
            self.verbose = other.verbose;
        }
    }

    /// Schema name to resolve
    pub fn schema(&self) -> &str {
        self.schema.as_deref().unwrap_or(DEFAULT_SCHEMA)
    }

    pub fn template_ignore(&self) -> Vec<String> {
        self.template_ignore.clone().unwrap_or_else(|| {
            DEFAULT_TEMPLATE_IGNORE
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    pub fn parent_fields(&self) -> ParentFields {
        ParentFields::with_overrides(&self.parent_fields)
    }

    pub fn verbose(&self) -> bool {
        self.verbose.unwrap_or(false)
    }
}
