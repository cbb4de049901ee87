//! Schema loading
//!
//! A schema is a directory holding one `.yml` config per entity type
//! (`Project.yml`, `Shot.yml`, ...) plus optional template directories.
//! Loading turns the configs into an arena of [`SchemaNode`]s addressed by
//! [`SchemaId`]. File references are memoized, so a schema may refer to
//! itself (an `Asset.yml` nesting `Asset` children).
//!
//! All file references inside configs are relative to the schema root.

use miette::Diagnostic;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::template::{Template, TemplateError};
use crate::schema::config::{ChildRef, NodeConfig};
use crate::schema::expr::{ExprError, Program};
use crate::yaml::YamlSyntaxError;

/// Handle to a node in a [`Schema`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(usize);

impl SchemaId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Errors raised while resolving or loading a schema
#[derive(Debug, Error, Diagnostic)]
pub enum SchemaError {
    #[error("schema '{0}' not found")]
    #[diagnostic(
        code(tfs::schema::not_found),
        help("add it to .tfs/schemas, a schema_paths entry, or TFS_SCHEMA_PATH")
    )]
    NotFound(String),

    #[error("schema file not found: {}", path.display())]
    #[diagnostic(code(tfs::schema::missing_file))]
    MissingFile { path: PathBuf },

    #[error("template '{template}' referenced by {origin} does not exist")]
    #[diagnostic(code(tfs::schema::missing_template))]
    MissingTemplate { origin: String, template: String },

    #[error("unknown node type '{kind}' in {origin}")]
    #[diagnostic(
        code(tfs::schema::unknown_kind),
        help("valid node types are: directory, entity, file, include")
    )]
    UnknownKind { origin: String, kind: String },

    #[error("invalid schema node in {origin}: {message}")]
    #[diagnostic(code(tfs::schema::invalid))]
    Invalid { origin: String, message: String },

    #[error("bad expression in {origin}")]
    #[diagnostic(code(tfs::schema::expr))]
    Expr {
        origin: String,
        #[source]
        #[diagnostic_source]
        source: ExprError,
    },

    #[error("bad name_format in {origin}: {source}")]
    #[diagnostic(code(tfs::schema::name_format))]
    Template {
        origin: String,
        #[source]
        source: TemplateError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Yaml(#[from] YamlSyntaxError),

    #[error("failed to read {}: {source}", path.display())]
    #[diagnostic(code(tfs::schema::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Closed set of node kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Entity { entity_type: String },
    File,
    Include,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Directory => "directory",
            NodeKind::Entity { .. } => "entity",
            NodeKind::File => "file",
            NodeKind::Include => "include",
        }
    }
}

/// How a node's path segment is named
#[derive(Debug, Clone)]
pub enum NameSpec {
    /// No name: directories stay at their parent's level, entities use
    /// their default name
    Unset,
    Literal(String),
    Expr(Program),
    Format(Template),
}

/// A loaded schema node
#[derive(Debug, Clone)]
pub struct SchemaNode {
    pub kind: NodeKind,
    pub name: NameSpec,
    pub condition: Option<Program>,
    /// Absolute template path (a directory to scan, or a file to copy)
    pub template: Option<PathBuf>,
    /// Static children, in declaration order
    pub contents: Vec<SchemaId>,
    /// Entity children keyed by context entity type
    pub children: BTreeMap<String, SchemaId>,
    /// Where the node was declared, for error messages
    pub origin: String,
}

/// A loaded schema
#[derive(Debug)]
pub struct Schema {
    root_dir: PathBuf,
    nodes: Vec<SchemaNode>,
    root: SchemaId,
}

impl Schema {
    /// Load the schema rooted at `<root_dir>/<entity_type>.yml`
    pub fn load(root_dir: &Path, entity_type: &str, ignore: &[String]) -> Result<Self, SchemaError> {
        let mut loader = Loader {
            root_dir,
            ignore,
            nodes: Vec::new(),
            memo: HashMap::new(),
        };
        let root = loader.load_file(&format!("{}.yml", entity_type), Some(entity_type))?;
        tracing::debug!(root = %root_dir.display(), nodes = loader.nodes.len(), "loaded schema");
        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            nodes: loader.nodes,
            root,
        })
    }

    pub fn root(&self) -> SchemaId {
        self.root
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn node(&self, id: SchemaId) -> &SchemaNode {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Indented outline of the schema
    pub fn outline(&self) -> String {
        let mut out = String::new();
        let mut stack = Vec::new();
        self.outline_node(self.root, 0, None, &mut stack, &mut out);
        out
    }

    fn outline_node(
        &self,
        id: SchemaId,
        depth: usize,
        key: Option<&str>,
        stack: &mut Vec<SchemaId>,
        out: &mut String,
    ) {
        let node = self.node(id);
        let indent = "  ".repeat(depth);
        let label = match &node.kind {
            NodeKind::Entity { entity_type } => format!("entity {}", entity_type),
            kind => kind.label().to_string(),
        };
        let name = match &node.name {
            NameSpec::Unset => String::new(),
            NameSpec::Literal(name) => format!(" \"{}\"", name),
            NameSpec::Expr(program) => format!(" = {}", program.source().trim()),
            NameSpec::Format(template) => format!(" = format \"{}\"", template),
        };
        let condition = node
            .condition
            .as_ref()
            .map(|c| format!(" if {}", c.source().trim()))
            .unwrap_or_default();
        let via = key.map(|k| format!("[{}] ", k)).unwrap_or_default();

        if stack.contains(&id) {
            let _ = writeln!(out, "{}{}{} (recursive)", indent, via, label);
            return;
        }
        let _ = writeln!(out, "{}{}{}{}{}", indent, via, label, name, condition);

        stack.push(id);
        for child in &node.contents {
            self.outline_node(*child, depth + 1, None, stack, out);
        }
        for (entity_type, child) in &node.children {
            self.outline_node(*child, depth + 1, Some(entity_type), stack, out);
        }
        stack.pop();
    }
}

/// Defaults implied by where a config was found
#[derive(Debug, Clone, Copy)]
enum Implied<'a> {
    Directory,
    File,
    /// A `children` entry: must be an entity node of this type
    Entity(&'a str),
}

struct Loader<'a> {
    root_dir: &'a Path,
    ignore: &'a [String],
    nodes: Vec<SchemaNode>,
    memo: HashMap<(String, Option<String>), SchemaId>,
}

impl<'a> Loader<'a> {
    fn load_file(&mut self, rel: &str, entity_type: Option<&str>) -> Result<SchemaId, SchemaError> {
        let memo_key = (rel.to_string(), entity_type.map(str::to_string));
        if let Some(id) = self.memo.get(&memo_key) {
            return Ok(*id);
        }

        let mut config = self.read_config(rel)?;

        // `X.yml` next to a directory `X` uses it as its template
        if config.template.is_none() {
            if let Some(stem) = rel.strip_suffix(".yml") {
                if self.root_dir.join(stem).is_dir() {
                    config.template = Some(stem.to_string());
                }
            }
        }

        // Reserve the slot first so recursive references resolve to it
        let id = SchemaId(self.nodes.len());
        self.nodes.push(SchemaNode {
            kind: NodeKind::Directory,
            name: NameSpec::Unset,
            condition: None,
            template: None,
            contents: Vec::new(),
            children: BTreeMap::new(),
            origin: rel.to_string(),
        });
        self.memo.insert(memo_key, id);

        let implied = entity_type.map(Implied::Entity).unwrap_or(Implied::Directory);
        let node = self.build(config, rel.to_string(), implied)?;
        self.nodes[id.0] = node;
        Ok(id)
    }

    fn read_config(&self, rel: &str) -> Result<NodeConfig, SchemaError> {
        let path = self.root_dir.join(rel);
        if !path.is_file() {
            return Err(SchemaError::MissingFile { path });
        }
        let content = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
            path: path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(NodeConfig::default());
        }
        serde_yml::from_str(&content)
            .map_err(|e| YamlSyntaxError::from_serde_error(&e, &content, rel).into())
    }

    fn push(&mut self, node: SchemaNode) -> SchemaId {
        self.nodes.push(node);
        SchemaId(self.nodes.len() - 1)
    }

    fn build(&mut self, config: NodeConfig, origin: String, implied: Implied<'_>) -> Result<SchemaNode, SchemaError> {
        let invalid = |message: String| SchemaError::Invalid {
            origin: origin.clone(),
            message,
        };

        let kind = match config.kind.as_deref() {
            Some("directory") => NodeKind::Directory,
            Some("file") => NodeKind::File,
            Some("include") => NodeKind::Include,
            Some("entity") => {
                let entity_type = config
                    .entity_type
                    .clone()
                    .or_else(|| match implied {
                        Implied::Entity(t) => Some(t.to_string()),
                        _ => None,
                    })
                    .ok_or_else(|| invalid("entity nodes need an entity_type".into()))?;
                NodeKind::Entity { entity_type }
            }
            Some(other) => {
                return Err(SchemaError::UnknownKind {
                    origin: origin.clone(),
                    kind: other.to_string(),
                })
            }
            None => match (&config.entity_type, &config.include, implied) {
                (Some(t), _, _) => NodeKind::Entity {
                    entity_type: t.clone(),
                },
                (None, Some(_), _) => NodeKind::Include,
                (None, None, Implied::Entity(t)) => NodeKind::Entity {
                    entity_type: t.to_string(),
                },
                (None, None, Implied::File) => NodeKind::File,
                (None, None, Implied::Directory) => NodeKind::Directory,
            },
        };

        if let Implied::Entity(expected) = implied {
            match &kind {
                NodeKind::Entity { entity_type } if entity_type == expected => {}
                _ => {
                    return Err(invalid(format!(
                        "child schema for '{}' must be an entity node of that type",
                        expected
                    )))
                }
            }
        }

        let naming = [&config.name, &config.name_expr, &config.name_format]
            .iter()
            .filter(|n| n.is_some())
            .count();
        if naming > 1 {
            return Err(invalid("use only one of name, name_expr and name_format".into()));
        }
        let name = if let Some(src) = &config.name_expr {
            NameSpec::Expr(Program::parse(src).map_err(|source| SchemaError::Expr {
                origin: origin.clone(),
                source,
            })?)
        } else if let Some(src) = &config.name_format {
            NameSpec::Format(Template::new(src).map_err(|source| SchemaError::Template {
                origin: origin.clone(),
                source,
            })?)
        } else if let Some(name) = &config.name {
            NameSpec::Literal(name.clone())
        } else {
            NameSpec::Unset
        };

        let condition = config
            .condition
            .as_deref()
            .map(Program::parse)
            .transpose()
            .map_err(|source| SchemaError::Expr {
                origin: origin.clone(),
                source,
            })?;

        let template = match &config.template {
            Some(rel) => {
                let path = self.root_dir.join(rel);
                if !path.exists() {
                    return Err(SchemaError::MissingTemplate {
                        origin: origin.clone(),
                        template: rel.clone(),
                    });
                }
                match (&kind, path.is_dir()) {
                    (NodeKind::File, true) => {
                        return Err(invalid(format!("file template '{}' is a directory", rel)))
                    }
                    (NodeKind::Directory | NodeKind::Entity { .. }, false) => {
                        return Err(invalid(format!("directory template '{}' is a file", rel)))
                    }
                    (NodeKind::Include, _) => {
                        return Err(invalid("include nodes cannot have a template".into()))
                    }
                    _ => {}
                }
                Some(path)
            }
            None => None,
        };

        match &kind {
            NodeKind::File if !config.contents.is_empty() || !config.children.is_empty() => {
                return Err(invalid("file nodes cannot have children".into()));
            }
            NodeKind::Include => {}
            _ if config.include.is_some() => {
                return Err(invalid("only include nodes may use 'include'".into()));
            }
            _ => {}
        }

        let mut contents = Vec::new();
        if matches!(kind, NodeKind::Directory | NodeKind::Entity { .. }) {
            if let Some(rel) = &config.template {
                contents.extend(self.scan(rel)?);
            }
        }
        for child in config.contents {
            contents.push(self.load_child(child, &origin, Implied::Directory)?);
        }
        if let Some(rel) = &config.include {
            contents.push(self.load_file(rel, None)?);
        }

        let mut children = BTreeMap::new();
        for (entity_type, child) in config.children {
            let id = self.load_child(child, &origin, Implied::Entity(&entity_type))?;
            children.insert(entity_type, id);
        }

        Ok(SchemaNode {
            kind,
            name,
            condition,
            template,
            contents,
            children,
            origin,
        })
    }

    fn load_child(&mut self, child: ChildRef, origin: &str, implied: Implied<'_>) -> Result<SchemaId, SchemaError> {
        match child {
            ChildRef::File(rel) => {
                let entity_type = match implied {
                    Implied::Entity(t) => Some(t),
                    _ => None,
                };
                self.load_file(&rel, entity_type)
            }
            ChildRef::Inline(config) => {
                let node = self.build(*config, format!("{} (inline)", origin), implied)?;
                Ok(self.push(node))
            }
        }
    }

    /// Turn the entries of a template directory into child nodes
    fn scan(&mut self, rel: &str) -> Result<Vec<SchemaId>, SchemaError> {
        let dir = self.root_dir.join(rel);
        let read = std::fs::read_dir(&dir).map_err(|source| SchemaError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut entries = BTreeMap::new();
        let mut overlays = BTreeSet::new();
        for entry in read {
            let entry = entry.map_err(|source| SchemaError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.ignore.iter().any(|i| *i == name) {
                continue;
            }
            match name.strip_suffix(".yml") {
                Some(stem) => {
                    overlays.insert(stem.to_string());
                }
                None => {
                    entries.insert(name, entry.path().is_dir());
                }
            }
        }

        let mut ids = Vec::new();
        for (name, is_dir) in &entries {
            let entry_rel = format!("{}/{}", rel, name);
            let mut config = NodeConfig {
                name: Some(name.clone()),
                template: Some(entry_rel.clone()),
                ..Default::default()
            };
            if overlays.contains(name) {
                config.overlay(self.read_config(&format!("{}.yml", entry_rel))?);
            }
            let implied = if *is_dir { Implied::Directory } else { Implied::File };
            let node = self.build(config, entry_rel, implied)?;
            ids.push(self.push(node));
        }

        // A lone `.yml` declares a node of its own
        for stem in overlays.iter().filter(|s| !entries.contains_key(*s)) {
            let file_rel = format!("{}/{}.yml", rel, stem);
            let mut config = self.read_config(&file_rel)?;
            let named = config.name.is_some() || config.name_expr.is_some() || config.name_format.is_some();
            let plain = config.entity_type.is_none() && config.include.is_none();
            if !named && plain && config.kind.as_deref().map_or(true, |k| k == "directory" || k == "file") {
                config.name = Some(stem.clone());
            }
            let node = self.build(config, file_rel, Implied::Directory)?;
            ids.push(self.push(node));
        }

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn ignore() -> Vec<String> {
        vec![".gitkeep".to_string()]
    }

    fn names(schema: &Schema, ids: &[SchemaId]) -> Vec<String> {
        ids.iter()
            .map(|id| match &schema.node(*id).name {
                NameSpec::Literal(name) => name.clone(),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_template_directory_becomes_children() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write(root, "Project.yml", "");
        write(root, "Project/Assets/.gitkeep", "");
        write(root, "Project/SEQ/.gitkeep", "");
        write(root, "Project/README.txt", "hello");
        write(root, "Project/SEQ.yml", "children:\n  Sequence: Sequence.yml\n");
        write(root, "Project/extra.yml", "condition: \"true\"\n");
        write(root, "Sequence.yml", "name_expr: self.code\n");

        let schema = Schema::load(root, "Project", &ignore()).unwrap();
        let project = schema.node(schema.root());
        assert_eq!(
            project.kind,
            NodeKind::Entity {
                entity_type: "Project".into()
            }
        );
        assert_eq!(names(&schema, &project.contents), ["Assets", "README.txt", "SEQ", "extra"]);

        let readme = schema.node(project.contents[1]);
        assert_eq!(readme.kind, NodeKind::File);
        assert_eq!(readme.template, Some(root.join("Project/README.txt")));

        let seq = schema.node(project.contents[2]);
        assert_eq!(seq.kind, NodeKind::Directory);
        let sequence = schema.node(seq.children["Sequence"]);
        assert!(matches!(sequence.name, NameSpec::Expr(_)));

        // Ignored entries never become nodes
        assert!(schema.node(project.contents[0]).contents.is_empty());
    }

    #[test]
    fn test_recursive_schema() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "children:\n  Asset: Asset.yml\n");
        write(tmp.path(), "Asset.yml", "children:\n  Asset: Asset.yml\n");

        let schema = Schema::load(tmp.path(), "Project", &ignore()).unwrap();
        let asset = schema.node(schema.root()).children["Asset"];
        assert_eq!(schema.node(asset).children["Asset"], asset);
        assert!(schema.outline().contains("(recursive)"));
    }

    #[test]
    fn test_include_and_inline_contents() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "contents:\n  - work.yml\n  - {name: docs}\n");
        write(
            tmp.path(),
            "work.yml",
            "type: include\ncontents:\n  - {name: work}\n  - {name: publish}\n",
        );

        let schema = Schema::load(tmp.path(), "Project", &ignore()).unwrap();
        let project = schema.node(schema.root());
        let include = schema.node(project.contents[0]);
        assert_eq!(include.kind, NodeKind::Include);
        assert_eq!(names(&schema, &include.contents), ["work", "publish"]);
        assert_eq!(names(&schema, &project.contents[1..]), ["docs"]);
    }

    #[test]
    fn test_unknown_kind() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "contents:\n  - {type: symlink, name: x}\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownKind { ref kind, .. } if kind == "symlink"));
    }

    #[test]
    fn test_missing_files_and_templates() {
        let tmp = TempDir::new().unwrap();
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingFile { .. }));

        write(tmp.path(), "Project.yml", "children:\n  Shot: Shot.yml\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingFile { .. }));

        write(tmp.path(), "Project.yml", "template: nowhere\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::MissingTemplate { .. }));
    }

    #[test]
    fn test_bad_expression_is_a_schema_error() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "name_expr: \"self.code +\"\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::Expr { .. }));
    }

    #[test]
    fn test_yaml_errors_carry_diagnostics() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "contents: [unclosed\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::Yaml(_)));

        write(tmp.path(), "Project.yml", "nmae: typo\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::Yaml(_)));
    }

    #[test]
    fn test_children_entries_must_match_their_type() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "children:\n  Shot: other.yml\n");
        write(tmp.path(), "other.yml", "entity_type: Asset\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }));
    }

    #[test]
    fn test_conflicting_name_settings() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Project.yml", "name: a\nname_expr: self.code\n");
        let err = Schema::load(tmp.path(), "Project", &ignore()).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }));
    }
}
