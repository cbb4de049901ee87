//! Core module - entities, sessions, context trees and the path cache

pub mod cache;
pub mod config;
pub mod context;
pub mod entity;
pub mod hierarchy;
pub mod project;
pub mod session;
pub mod store;
pub mod tags;
pub mod template;

pub use cache::{CacheError, CacheStats, CachedPath, PathCache, SyncStats};
pub use config::Config;
pub use context::{context_from_path, ContextError, ContextTree, NodeId};
pub use entity::{Entity, EntityKey, KeyParseError, Value};
pub use hierarchy::ParentFields;
pub use project::{Project, ProjectError};
pub use session::{EntityData, RawEntity, Session, SessionError};
pub use store::{BatchRequest, FetchRequest, Filter, FilterOp, MemoryStore, Record, RecordStore, StoreError};
pub use tags::{Tag, TagError, TAG_FILE};
pub use template::{Template, TemplateError};
