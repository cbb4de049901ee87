//! Schema system - loading, rendering and processing directory structures

pub mod config;
pub mod expr;
pub mod loader;
pub mod processor;
pub mod registry;
pub mod structure;

pub use config::{ChildRef, NodeConfig};
pub use expr::{ExprError, ExprErrorKind, Program};
pub use loader::{NameSpec, NodeKind, Schema, SchemaError, SchemaId, SchemaNode};
pub use processor::{DryRunProcessor, FsProcessor, Operation, ProcessError, ProcessStats, Processor};
pub use registry::{EmbeddedResolver, SchemaRegistry, SchemaResolver, SearchPathResolver};
pub use structure::{RenderError, Structure, StructureKind, StructureNode};
