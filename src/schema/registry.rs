//! Schema name resolution
//!
//! A schema name resolves to a directory through an ordered list of
//! resolvers; the first one that knows the name wins. Names may pin a
//! version (`studio@v2`); without a pin the highest `v<N>` subdirectory is
//! used when the schema is versioned.

use rust_embed::Embed;
use std::path::{Path, PathBuf};

use crate::core::{Config, Project};
use crate::schema::loader::SchemaError;

#[derive(Embed)]
#[folder = "schemas/"]
struct BundledSchemas;

/// Something that can locate schema directories by name
pub trait SchemaResolver {
    /// Short label shown by `tfs schema list`
    fn label(&self) -> String;

    /// Directory for the schema, or `None` if this resolver does not know it
    fn resolve(&self, name: &str) -> Result<Option<PathBuf>, SchemaError>;

    /// Schema names this resolver can provide
    fn available(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Ordered collection of resolvers
#[derive(Default)]
pub struct SchemaRegistry {
    resolvers: Vec<Box<dyn SchemaResolver>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry used by the CLI: project schemas, configured search paths,
    /// then the bundled schemas
    pub fn for_project(project: Option<&Project>, config: &Config) -> Self {
        let mut paths = Vec::new();
        if let Some(project) = project {
            paths.push(project.schema_dir());
        }
        paths.extend(config.schema_paths.iter().cloned());

        let mut registry = Self::new();
        registry.register(SearchPathResolver::new(paths));
        registry.register(EmbeddedResolver::new(Config::cache_dir()));
        registry
    }

    pub fn register(&mut self, resolver: impl SchemaResolver + 'static) -> &mut Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, SchemaError> {
        for resolver in &self.resolvers {
            if let Some(dir) = resolver.resolve(name)? {
                tracing::debug!(schema = name, resolver = %resolver.label(), dir = %dir.display(), "resolved schema");
                return Ok(dir);
            }
        }
        Err(SchemaError::NotFound(name.to_string()))
    }

    /// `(resolver label, schema name)` for every known schema
    pub fn available(&self) -> Vec<(String, String)> {
        self.resolvers
            .iter()
            .flat_map(|r| {
                let label = r.label();
                r.available().into_iter().map(move |name| (label.clone(), name))
            })
            .collect()
    }
}

/// Split `name@vN` into its name and pinned version
pub fn split_version(name: &str) -> Result<(&str, Option<u32>), SchemaError> {
    match name.split_once('@') {
        None => Ok((name, None)),
        Some((base, version)) => version
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .map(|v| (base, Some(v)))
            .ok_or_else(|| SchemaError::NotFound(name.to_string())),
    }
}

/// Pick the versioned directory inside a schema directory
fn pick_version(dir: &Path, version: Option<u32>) -> Option<PathBuf> {
    if let Some(v) = version {
        let pinned = dir.join(format!("v{}", v));
        return pinned.is_dir().then_some(pinned);
    }

    let latest = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix('v')?.parse::<u32>().ok()
        })
        .max();

    Some(match latest {
        Some(v) => dir.join(format!("v{}", v)),
        None => dir.to_path_buf(),
    })
}

/// Looks for `<path>/<name>` in each search path in order
pub struct SearchPathResolver {
    paths: Vec<PathBuf>,
}

impl SearchPathResolver {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

impl SchemaResolver for SearchPathResolver {
    fn label(&self) -> String {
        "search path".to_string()
    }

    fn resolve(&self, name: &str) -> Result<Option<PathBuf>, SchemaError> {
        let (base, version) = split_version(name)?;
        for path in &self.paths {
            let candidate = path.join(base);
            if candidate.is_dir() {
                if let Some(dir) = pick_version(&candidate, version) {
                    return Ok(Some(dir));
                }
            }
        }
        Ok(None)
    }

    fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .paths
            .iter()
            .filter_map(|path| std::fs::read_dir(path).ok())
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Serves the schemas bundled into the binary
///
/// Schema loading works on directories, so a bundled schema is written out
/// under the user cache directory the first time it is resolved.
pub struct EmbeddedResolver {
    cache_dir: PathBuf,
}

impl EmbeddedResolver {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        let cache_dir = cache_dir.unwrap_or_else(|| std::env::temp_dir().join("tfs"));
        Self {
            cache_dir: cache_dir.join("schemas"),
        }
    }

    fn materialize(&self, base: &str) -> Result<Option<PathBuf>, SchemaError> {
        let prefix = format!("{}/", base);
        let mut found = false;

        for file in BundledSchemas::iter() {
            let Some(rel) = file.strip_prefix(&prefix) else {
                continue;
            };
            let Some(content) = BundledSchemas::get(&file) else {
                continue;
            };
            found = true;

            let target = self.cache_dir.join(base).join(rel);
            if std::fs::read(&target).ok().as_deref() == Some(content.data.as_ref()) {
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|source| SchemaError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            std::fs::write(&target, &content.data).map_err(|source| SchemaError::Io {
                path: target.clone(),
                source,
            })?;
        }

        Ok(found.then(|| self.cache_dir.join(base)))
    }
}

impl SchemaResolver for EmbeddedResolver {
    fn label(&self) -> String {
        "bundled".to_string()
    }

    fn resolve(&self, name: &str) -> Result<Option<PathBuf>, SchemaError> {
        let (base, version) = split_version(name)?;
        match self.materialize(base)? {
            Some(dir) => Ok(pick_version(&dir, version)),
            None => Ok(None),
        }
    }

    fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = BundledSchemas::iter()
            .filter_map(|file| file.split('/').next().map(str::to_string))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
