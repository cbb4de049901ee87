//! Context graph builder
//!
//! Reconstructs the minimal tree connecting a set of entities to their
//! single top-level ancestor. Nodes live in an arena and are addressed by
//! [`NodeId`]; each entity gets at most one node.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;

use crate::core::entity::Entity;
use crate::core::session::{Session, SessionError};
use crate::core::tags::{self, TagError};

/// Stable index of a node inside a [`ContextTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Errors raised while building a context tree
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no common root found for entities: {}", .entities.join(", "))]
    NoRoot { entities: Vec<String> },

    #[error("entities resolve to more than one root ({}): {}", .roots.join(", "), .entities.join(", "))]
    AmbiguousRoot {
        roots: Vec<String>,
        entities: Vec<String>,
    },

    #[error("parent chain of {entity} loops back on itself")]
    Cycle { entity: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Tag(#[from] TagError),
}

/// A node wrapping exactly one entity
#[derive(Debug, Clone)]
pub struct ContextNode {
    entity: Entity,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl ContextNode {
    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Tree of entities rooted at their common top-level ancestor
#[derive(Debug, Clone)]
pub struct ContextTree {
    nodes: Vec<ContextNode>,
    by_entity: HashMap<Entity, NodeId>,
    root: NodeId,
}

/// Per-build bookkeeping
struct Builder<'s> {
    session: &'s mut Session,
    nodes: Vec<ContextNode>,
    by_entity: HashMap<Entity, NodeId>,
    resolved: Vec<bool>,
    roots: Vec<NodeId>,
}

impl<'s> Builder<'s> {
    fn node_for(&mut self, entity: Entity) -> NodeId {
        if let Some(&id) = self.by_entity.get(&entity) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(ContextNode {
            entity,
            parent: None,
            children: Vec::new(),
        });
        self.resolved.push(false);
        self.by_entity.insert(entity, id);
        id
    }

    /// True if `candidate` is `node` or one of its ancestors
    fn reaches(&self, mut candidate: NodeId, node: NodeId) -> bool {
        for _ in 0..=self.nodes.len() {
            if candidate == node {
                return true;
            }
            match self.nodes[candidate.0].parent {
                Some(parent) => candidate = parent,
                None => return false,
            }
        }
        true
    }

    fn run(&mut self, entities: &[Entity]) -> Result<(), ContextError> {
        // Stack: the last pushed entity is processed first
        let mut work: Vec<Entity> = entities.iter().rev().copied().collect();

        while let Some(entity) = work.pop() {
            self.session.data(entity)?;
            let node = self.node_for(entity);
            if self.resolved[node.0] {
                continue;
            }

            match self.session.parent(entity)? {
                None => {
                    self.resolved[node.0] = true;
                    self.roots.push(node);
                }
                Some(parent) => match self.by_entity.get(&parent).copied() {
                    Some(parent_node) => {
                        if self.reaches(parent_node, node) {
                            return Err(ContextError::Cycle {
                                entity: self.session.describe(entity),
                            });
                        }
                        self.nodes[node.0].parent = Some(parent_node);
                        self.nodes[parent_node.0].children.push(node);
                        self.resolved[node.0] = true;
                    }
                    None => {
                        work.push(entity);
                        work.push(parent);
                    }
                },
            }
        }
        Ok(())
    }
}

impl ContextTree {
    /// Build the minimal tree connecting `entities` to their shared root
    ///
    /// Duplicate entities collapse to one node. Children are ordered by
    /// entity type, then id, so any permutation of the input yields the same
    /// edges. Fails when the entities resolve to no root or to several.
    pub fn build(session: &mut Session, entities: &[Entity]) -> Result<Self, ContextError> {
        let describe_all = |session: &Session| -> Vec<String> {
            entities.iter().map(|&e| session.describe(e)).collect()
        };

        if entities.is_empty() {
            return Err(ContextError::NoRoot {
                entities: Vec::new(),
            });
        }

        // Fill parent fields level by level before walking
        session.fetch_parents(entities)?;

        let mut builder = Builder {
            session,
            nodes: Vec::new(),
            by_entity: HashMap::new(),
            resolved: Vec::new(),
            roots: Vec::new(),
        };
        builder.run(entities)?;

        let Builder {
            session,
            mut nodes,
            by_entity,
            roots,
            ..
        } = builder;

        let root = match roots.as_slice() {
            [] => {
                return Err(ContextError::NoRoot {
                    entities: describe_all(&*session),
                })
            }
            [root] => *root,
            _ => {
                let mut names: Vec<String> = roots
                    .iter()
                    .map(|r| session.describe(nodes[r.0].entity))
                    .collect();
                names.sort();
                return Err(ContextError::AmbiguousRoot {
                    roots: names,
                    entities: describe_all(&*session),
                });
            }
        };

        let sort_keys: Vec<(String, Option<i64>, Entity)> = nodes
            .iter()
            .map(|n| {
                let data = session.get(n.entity);
                (
                    data.map(|d| d.entity_type().to_string()).unwrap_or_default(),
                    data.and_then(|d| d.id()),
                    n.entity,
                )
            })
            .collect();
        for node in &mut nodes {
            node.children.sort_by(|a, b| sort_keys[a.0].cmp(&sort_keys[b.0]));
        }

        tracing::debug!(nodes = nodes.len(), root = %session.describe(nodes[root.0].entity), "built context tree");

        Ok(Self {
            nodes,
            by_entity,
            root,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &ContextNode {
        &self.nodes[id.0]
    }

    pub fn entity(&self, id: NodeId) -> Entity {
        self.nodes[id.0].entity
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    /// Ancestors of a node, nearest first, excluding the node itself
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(node) = current {
            out.push(node);
            current = self.parent(node);
        }
        out
    }

    /// Node bound to an entity, if the entity is in the tree
    pub fn find(&self, entity: Entity) -> Option<NodeId> {
        self.by_entity.get(&entity).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Depth-first, pre-order traversal starting at the root
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut stack = vec![self.root];
        std::iter::from_fn(move || {
            let id = stack.pop()?;
            stack.extend(self.children(id).iter().rev().copied());
            Some(id)
        })
    }

    /// Expression namespace for a node: every ancestor keyed by its type,
    /// plus `self`
    ///
    /// Nearer ancestors shadow farther ones of the same type.
    pub fn namespace(&self, session: &Session, id: NodeId) -> BTreeMap<String, Entity> {
        let mut ns = BTreeMap::new();
        for ancestor in self.ancestors(id).into_iter().rev() {
            let entity = self.entity(ancestor);
            if let Some(entity_type) = session.entity_type(entity) {
                ns.insert(entity_type.to_string(), entity);
            }
        }
        let entity = self.entity(id);
        if let Some(entity_type) = session.entity_type(entity) {
            ns.insert(entity_type.to_string(), entity);
        }
        ns.insert("self".to_string(), entity);
        ns
    }

    /// Indented, one-entity-per-line rendering of the tree
    pub fn dump(&self, session: &Session) -> String {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let _ = writeln!(out, "{}{}", "  ".repeat(depth), session.describe(self.entity(id)));
            for &child in self.children(id).iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }

    /// Edges as `(parent, child)` entity pairs, in traversal order
    pub fn edges(&self) -> Vec<(Entity, Entity)> {
        self.iter()
            .flat_map(|id| {
                self.children(id)
                    .iter()
                    .map(move |&child| (self.entity(id), self.entity(child)))
            })
            .collect()
    }
}

/// Build a context from the tagged directories enclosing `path`
pub fn context_from_path(session: &mut Session, path: &Path) -> Result<ContextTree, ContextError> {
    let entities = tags::entities_from_path(session, path)?;
    ContextTree::build(session, &entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityKey;
    use crate::core::store::{MemoryStore, Record};
    use serde_json::{json, Value as JsonValue};

    fn record(value: JsonValue) -> Record {
        value.as_object().unwrap().clone()
    }

    fn project_session() -> Session {
        let store = MemoryStore::from_json(json!({
            "Project": [{"id": 1, "name": "demo"}, {"id": 2, "name": "other"}],
            "Sequence": [
                {"id": 10, "code": "AA", "project": {"type": "Project", "id": 1}},
                {"id": 11, "code": "BB", "project": {"type": "Project", "id": 1}},
                {"id": 12, "code": "CC", "project": {"type": "Project", "id": 2}}
            ],
            "Shot": [
                {"id": 100, "code": "AA_001", "sequence": {"type": "Sequence", "id": 10}},
                {"id": 101, "code": "AA_002", "sequence": {"type": "Sequence", "id": 10}},
                {"id": 110, "code": "BB_001", "sequence": {"type": "Sequence", "id": 11}}
            ],
            "Task": [
                {"id": 1000, "content": "anim", "entity": {"type": "Shot", "id": 100}},
                {"id": 1001, "content": "comp", "entity": {"type": "Shot", "id": 110}}
            ]
        }))
        .unwrap();
        Session::with_store(store)
    }

    fn merge(session: &mut Session, entity_type: &str, id: i64) -> Entity {
        session
            .merge(record(json!({"type": entity_type, "id": id})))
            .unwrap()
    }

    fn edge_keys(session: &Session, tree: &ContextTree) -> Vec<(EntityKey, EntityKey)> {
        let mut edges: Vec<_> = tree
            .edges()
            .into_iter()
            .map(|(p, c)| (session.key(p).unwrap(), session.key(c).unwrap()))
            .collect();
        edges.sort();
        edges
    }

    #[test]
    fn test_build_minimal_tree() {
        let mut session = project_session();
        let task = merge(&mut session, "Task", 1000);
        let tree = ContextTree::build(&mut session, &[task]).unwrap();

        assert_eq!(tree.len(), 4);
        let root = session.key(tree.entity(tree.root())).unwrap();
        assert_eq!(root, EntityKey::new("Project", 1));

        let leaf = tree.find(task).unwrap();
        assert_eq!(tree.ancestors(leaf).len(), 3);
        assert!(tree.children(leaf).is_empty());
    }

    #[test]
    fn test_build_shares_ancestors() {
        let mut session = project_session();
        let a = merge(&mut session, "Task", 1000);
        let b = merge(&mut session, "Task", 1001);
        let c = merge(&mut session, "Shot", 101);
        let tree = ContextTree::build(&mut session, &[a, b, c]).unwrap();

        // Project, 2 sequences, 3 shots, 2 tasks
        assert_eq!(tree.len(), 8);
        let root = tree.root();
        assert_eq!(tree.children(root).len(), 2);
    }

    #[test]
    fn test_build_is_order_and_duplicate_invariant() {
        let mut session = project_session();
        let a = merge(&mut session, "Task", 1000);
        let b = merge(&mut session, "Task", 1001);
        let c = merge(&mut session, "Shot", 101);

        let first = ContextTree::build(&mut session, &[a, b, c]).unwrap();
        let second = ContextTree::build(&mut session, &[c, b, a, c, a]).unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(edge_keys(&session, &first), edge_keys(&session, &second));
        assert_eq!(first.edges(), second.edges());
    }

    #[test]
    fn test_build_empty_has_no_root() {
        let mut session = project_session();
        assert!(matches!(
            ContextTree::build(&mut session, &[]),
            Err(ContextError::NoRoot { .. })
        ));
    }

    #[test]
    fn test_build_two_projects_is_ambiguous() {
        let mut session = project_session();
        let a = merge(&mut session, "Sequence", 10);
        let b = merge(&mut session, "Sequence", 12);
        let err = ContextTree::build(&mut session, &[a, b]).unwrap_err();
        match err {
            ContextError::AmbiguousRoot { roots, entities } => {
                assert_eq!(roots.len(), 2);
                assert_eq!(entities.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_project_only() {
        let mut session = project_session();
        let project = merge(&mut session, "Project", 1);
        let tree = ContextTree::build(&mut session, &[project]).unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.entity(tree.root()), project);
    }

    #[test]
    fn test_build_without_store_uses_known_fields() {
        let mut session = Session::new();
        let shot = session
            .merge(record(json!({
                "type": "Shot", "id": 1,
                "sequence": {"type": "Sequence", "id": 2, "project": {"type": "Project", "id": 3}}
            })))
            .unwrap();
        let tree = ContextTree::build(&mut session, &[shot]).unwrap();
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_build_detects_cycles() {
        let mut session = Session::new();
        let a = session
            .merge(record(json!({"type": "Shot", "id": 1, "sequence": {"type": "Shot", "id": 2}})))
            .unwrap();
        session
            .merge(record(json!({"type": "Shot", "id": 2, "sequence": {"type": "Shot", "id": 1}})))
            .unwrap();
        assert!(matches!(
            ContextTree::build(&mut session, &[a]),
            Err(ContextError::Cycle { .. })
        ));
    }

    #[test]
    fn test_namespace_and_dump() {
        let mut session = project_session();
        let task = merge(&mut session, "Task", 1000);
        let tree = ContextTree::build(&mut session, &[task]).unwrap();
        let ns = tree.namespace(&session, tree.find(task).unwrap());

        assert_eq!(ns.get("self"), Some(&task));
        assert!(ns.contains_key("Shot"));
        assert!(ns.contains_key("Sequence"));
        assert!(ns.contains_key("Project"));

        let dump = tree.dump(&session);
        assert_eq!(dump.lines().count(), 4);
        assert!(dump.lines().last().unwrap().starts_with("      Task:1000"));
    }

    #[test]
    fn test_children_sorted_by_id() {
        let mut session = project_session();
        let b = merge(&mut session, "Shot", 101);
        let a = merge(&mut session, "Shot", 100);
        let tree = ContextTree::build(&mut session, &[b, a]).unwrap();
        let seq = tree.parent(tree.find(a).unwrap()).unwrap();
        let ids: Vec<i64> = tree
            .children(seq)
            .iter()
            .map(|&n| session.key(tree.entity(n)).unwrap().id)
            .collect();
        assert_eq!(ids, vec![100, 101]);
    }

    #[test]
    fn test_context_from_tagged_path() {
        let mut session = project_session();
        let shot = merge(&mut session, "Shot", 100);
        ContextTree::build(&mut session, &[shot]).unwrap();
        let seq = session.parent(shot).unwrap().unwrap();
        let project = session.parent(seq).unwrap().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let seq_dir = dir.path().join("AA");
        let shot_dir = seq_dir.join("AA_100");
        std::fs::create_dir_all(&shot_dir).unwrap();
        tags::add_tag(dir.path(), &session.to_tag(project)).unwrap();
        tags::add_tag(&seq_dir, &session.to_tag(seq)).unwrap();
        tags::add_tag(&shot_dir, &session.to_tag(shot)).unwrap();

        // A fresh session has no store; the parent links come from the tags
        let mut fresh = Session::new();
        let tree = context_from_path(&mut fresh, &shot_dir).unwrap();
        assert_eq!(tree.len(), 3);
        let root = tree.entity(tree.root());
        assert_eq!(fresh.key(root), Some(EntityKey::new("Project", 1)));
    }
}
