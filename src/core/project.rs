//! Project discovery and structure

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the directory marking a project root
pub const PROJECT_DIR: &str = ".tfs";

/// Represents a TFS project
#[derive(Debug)]
pub struct Project {
    /// Root directory of the project (parent of .tfs/)
    root: PathBuf,
}

impl Project {
    /// Find project root by walking up from the current directory
    pub fn discover() -> Result<Self, ProjectError> {
        let current = std::env::current_dir().map_err(|e| ProjectError::IoError(e.to_string()))?;
        Self::discover_from(&current)
    }

    /// Find project root by walking up from the given directory
    pub fn discover_from(start: &Path) -> Result<Self, ProjectError> {
        let mut current = start
            .canonicalize()
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        loop {
            if current.join(PROJECT_DIR).is_dir() {
                return Ok(Self { root: current });
            }

            if !current.pop() {
                return Err(ProjectError::NotFound {
                    searched_from: start.to_path_buf(),
                });
            }
        }
    }

    /// Create a new project structure at the given path
    pub fn init(path: &Path) -> Result<Self, ProjectError> {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        if root.join(PROJECT_DIR).exists() {
            return Err(ProjectError::AlreadyExists(root));
        }

        Self::create_layout(root)
    }

    /// Force initialization even if .tfs/ exists
    ///
    /// An existing config file is kept.
    pub fn init_force(path: &Path) -> Result<Self, ProjectError> {
        let root = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Self::create_layout(root)
    }

    fn create_layout(root: PathBuf) -> Result<Self, ProjectError> {
        let tfs_dir = root.join(PROJECT_DIR);

        // Project-local schemas take precedence over configured search paths
        std::fs::create_dir_all(tfs_dir.join("schemas"))
            .map_err(|e| ProjectError::IoError(e.to_string()))?;

        let config_path = tfs_dir.join("config.yaml");
        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_config())
                .map_err(|e| ProjectError::IoError(e.to_string()))?;
        }

        Ok(Self { root })
    }

    fn default_config() -> &'static str {
        r#"# TFS Project Configuration

# Schema used to build directory structures (name or name@vN)
# schema: default

# Extra directories searched for schemas
# schema_paths: []

# Records file backing the local record store (YAML or JSON)
# records: records.yaml

# Template entries never turned into schema nodes
# template_ignore: [".DS_Store", "Thumbs.db"]

# Extra or overridden parent fields, by entity type (null = top level)
# parent_fields:
#   Episode: null
#   Sequence: episode
"#
    }

    /// Get the project root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the .tfs configuration directory
    pub fn tfs_dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR)
    }

    /// Project configuration file
    pub fn config_path(&self) -> PathBuf {
        self.tfs_dir().join("config.yaml")
    }

    /// Directory of project-local schemas
    pub fn schema_dir(&self) -> PathBuf {
        self.tfs_dir().join("schemas")
    }

    /// Resolve a path given on the command line against the project root
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Errors that can occur during project operations
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("not a TFS project (searched from {searched_from:?}). Run 'tfs init' to create one.")]
    NotFound { searched_from: PathBuf },

    #[error("TFS project already exists at {0:?}")]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    IoError(String),
}
