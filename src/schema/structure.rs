//! Rendering a schema against a context tree
//!
//! Rendering is pure: it reads the session, the context tree, the schema
//! and (for entity path reuse) the path cache, and produces a
//! [`Structure`] describing what should exist on disk. Nothing is created
//! until the structure is handed to a [`Processor`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::cache::{CacheError, PathCache};
use crate::core::context::{ContextTree, NodeId};
use crate::core::entity::{Entity, EntityKey, Value};
use crate::core::session::Session;
use crate::core::store::Record;
use crate::core::template::TemplateError;
use crate::schema::expr::{self, ExprError};
use crate::schema::loader::{NameSpec, NodeKind, Schema, SchemaId, SchemaNode};
use crate::schema::processor::{ProcessError, Processor};

/// Errors that abort a render
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("expression in {origin} failed: {source}")]
    Expr {
        origin: String,
        #[source]
        source: ExprError,
    },

    #[error("name_format in {origin} failed: {source}")]
    Format {
        origin: String,
        #[source]
        source: TemplateError,
    },

    #[error("invalid name '{name}' from {origin}")]
    InvalidName { origin: String, name: String },

    #[error("file node in {origin} has no name")]
    MissingName { origin: String },

    #[error("naming collision at {}: {existing} and {incoming}", path.display())]
    Collision {
        path: PathBuf,
        existing: String,
        incoming: String,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// What a rendered node will produce
#[derive(Debug, Clone, PartialEq)]
pub enum StructureKind {
    Directory,
    Entity {
        entity: Entity,
        /// `None` for entities not yet saved to the record store
        key: Option<EntityKey>,
        /// Tag payload for the directory
        link: Record,
        /// Path came from the path cache
        reused: bool,
    },
    File {
        template: Option<PathBuf>,
    },
    Include,
}

/// A rendered node
#[derive(Debug, Clone, PartialEq)]
pub struct StructureNode {
    pub kind: StructureKind,
    pub path: PathBuf,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    fn visit<'a>(&'a self, out: &mut Vec<&'a StructureNode>) {
        out.push(self);
        for child in &self.children {
            child.visit(out);
        }
    }
}

/// A rendered structure, ready to be processed
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    root: StructureNode,
}

impl Structure {
    /// Render a schema against the context tree rooted at `root_path`
    ///
    /// Returns `Ok(None)` when the schema root does not fit the context
    /// root.
    pub fn render(
        schema: &Schema,
        session: &Session,
        context: &ContextTree,
        root_path: &Path,
        cache: Option<&PathCache>,
    ) -> Result<Option<Self>, RenderError> {
        let mut renderer = Renderer {
            schema,
            session,
            context,
            cache,
            occupied: HashMap::new(),
        };
        let root = renderer.render(schema.root(), context.root(), root_path)?;
        Ok(root.map(|root| Self { root }))
    }

    pub fn root(&self) -> &StructureNode {
        &self.root
    }

    /// All nodes, depth first
    pub fn nodes(&self) -> Vec<&StructureNode> {
        let mut out = Vec::new();
        self.root.visit(&mut out);
        out
    }

    /// Bound entities and their directories
    pub fn entity_paths(&self) -> Vec<(Entity, &Path)> {
        self.nodes()
            .into_iter()
            .filter_map(|node| match &node.kind {
                StructureKind::Entity { entity, .. } => Some((*entity, node.path.as_path())),
                _ => None,
            })
            .collect()
    }

    /// Emit every operation, depth first
    pub fn process(&self, processor: &mut dyn Processor) -> Result<(), ProcessError> {
        process_node(&self.root, processor)
    }
}

fn process_node(node: &StructureNode, processor: &mut dyn Processor) -> Result<(), ProcessError> {
    match &node.kind {
        StructureKind::Directory => processor.mkdir(&node.path)?,
        StructureKind::Entity { key, link, .. } => {
            processor.mkdir(&node.path)?;
            if let Some(key) = key {
                processor.tag(&node.path, key, link)?;
            }
        }
        StructureKind::File { template: Some(source) } => processor.copy(source, &node.path)?,
        StructureKind::File { template: None } => processor.touch(&node.path)?,
        StructureKind::Include => {}
    }
    for child in &node.children {
        process_node(child, processor)?;
    }
    Ok(())
}

/// What claimed a path during this render
///
/// Entities of one type may share a directory; each gets its own tag.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Occupant {
    Directory,
    File,
    Entity(String),
}

struct Renderer<'a> {
    schema: &'a Schema,
    session: &'a Session,
    context: &'a ContextTree,
    cache: Option<&'a PathCache>,
    occupied: HashMap<PathBuf, Occupant>,
}

impl<'a> Renderer<'a> {
    fn render(&mut self, id: SchemaId, at: NodeId, parent: &Path) -> Result<Option<StructureNode>, RenderError> {
        let (schema, context) = (self.schema, self.context);
        let node = schema.node(id);
        let entity = context.entity(at);

        if let NodeKind::Entity { entity_type } = &node.kind {
            if self.session.entity_type(entity) != Some(entity_type.as_str()) {
                tracing::debug!(
                    schema = %node.origin,
                    entity = %self.session.describe(entity),
                    "entity type does not match, pruning"
                );
                return Ok(None);
            }
        }

        let names = self.namespace(at);
        if let Some(condition) = &node.condition {
            let value = condition
                .eval(self.session, &names)
                .map_err(|source| RenderError::Expr {
                    origin: node.origin.clone(),
                    source,
                })?;
            if !value.truthy() {
                tracing::debug!(schema = %node.origin, "condition is false, pruning");
                return Ok(None);
            }
        }

        let segment = self.name(node, entity, &names)?;
        let mut path = match &segment {
            Some(segment) => parent.join(segment),
            None => parent.to_path_buf(),
        };

        let kind = match &node.kind {
            NodeKind::Directory => {
                if segment.is_some() {
                    self.occupy(&path, Occupant::Directory)?;
                }
                StructureKind::Directory
            }
            NodeKind::Entity { entity_type } => {
                // `name: ""` binds the entity to its parent's directory
                let explicit_here = matches!(&node.name, NameSpec::Literal(name) if name.is_empty());
                if segment.is_none() && !explicit_here {
                    return Err(RenderError::InvalidName {
                        origin: node.origin.clone(),
                        name: String::new(),
                    });
                }
                let key = self.session.key(entity);
                let mut reused = false;
                if let (Some(cache), Some(key)) = (self.cache, &key) {
                    if let Some(existing) = cache.get(key)? {
                        tracing::debug!(entity = %key, path = %existing.display(), "reusing cached path");
                        path = existing;
                        reused = true;
                    }
                }
                self.occupy(&path, Occupant::Entity(entity_type.clone()))?;
                StructureKind::Entity {
                    entity,
                    key,
                    link: self.session.to_tag(entity),
                    reused,
                }
            }
            NodeKind::File => {
                if segment.is_none() {
                    return Err(RenderError::MissingName {
                        origin: node.origin.clone(),
                    });
                }
                self.occupy(&path, Occupant::File)?;
                StructureKind::File {
                    template: node.template.clone(),
                }
            }
            // Includes contribute no path segment of their own
            NodeKind::Include => {
                path = parent.to_path_buf();
                StructureKind::Include
            }
        };

        let mut children = Vec::new();
        for child in &node.contents {
            if let Some(rendered) = self.render(*child, at, &path)? {
                children.push(rendered);
            }
        }
        for child_at in context.children(at) {
            let child_entity = context.entity(*child_at);
            let Some(child_type) = self.session.entity_type(child_entity) else {
                continue;
            };
            if let Some(child) = node.children.get(child_type) {
                if let Some(rendered) = self.render(*child, *child_at, &path)? {
                    children.push(rendered);
                }
            }
        }

        Ok(Some(StructureNode {
            kind,
            path,
            children,
        }))
    }

    /// Ancestor entities keyed by type, plus `self`
    fn namespace(&self, at: NodeId) -> BTreeMap<String, Value> {
        self.context
            .namespace(self.session, at)
            .into_iter()
            .map(|(name, entity)| (name, Value::Entity(entity)))
            .collect()
    }

    fn name(
        &self,
        node: &SchemaNode,
        entity: Entity,
        names: &BTreeMap<String, Value>,
    ) -> Result<Option<String>, RenderError> {
        let name = match &node.name {
            NameSpec::Unset => match node.kind {
                NodeKind::Entity { .. } => self.session.default_name(entity),
                _ => String::new(),
            },
            NameSpec::Literal(name) => name.clone(),
            NameSpec::Expr(program) => {
                let value = program
                    .eval(self.session, names)
                    .map_err(|source| RenderError::Expr {
                        origin: node.origin.clone(),
                        source,
                    })?;
                expr::to_text(self.session, &value)
            }
            NameSpec::Format(template) => template
                .render(&self.format_fields(entity, names))
                .map_err(|source| RenderError::Format {
                    origin: node.origin.clone(),
                    source,
                })?,
        };

        if name.is_empty() {
            return Ok(None);
        }
        if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(RenderError::InvalidName {
                origin: node.origin.clone(),
                name,
            });
        }
        Ok(Some(name))
    }

    /// Fields visible to `name_format`: the entity's own fields at the top
    /// level, and each namespace entry under its name
    fn format_fields(&self, entity: Entity, names: &BTreeMap<String, Value>) -> Record {
        let mut fields = self.session.to_json(entity);
        for (name, value) in names {
            if let Value::Entity(e) = value {
                fields.insert(name.clone(), self.session.to_json(*e).into());
            }
        }
        fields
    }

    fn occupy(&mut self, path: &Path, occupant: Occupant) -> Result<(), RenderError> {
        match self.occupied.get(path) {
            None => {
                self.occupied.insert(path.to_path_buf(), occupant);
                Ok(())
            }
            Some(existing) if *existing == occupant => Ok(()),
            Some(existing) => Err(RenderError::Collision {
                path: path.to_path_buf(),
                existing: describe(existing),
                incoming: describe(&occupant),
            }),
        }
    }

}

fn describe(occupant: &Occupant) -> String {
    match occupant {
        Occupant::Directory => "a directory".to_string(),
        Occupant::File => "a file".to_string(),
        Occupant::Entity(entity_type) => format!("a {} entity", entity_type),
    }
}
