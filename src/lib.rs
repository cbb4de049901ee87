//! TFS: Tessera FS
//!
//! Maps production-tracking entity hierarchies (Project → Sequence → Shot →
//! Task) onto directory structures described by declarative folder schemas,
//! and maps directories back to the entities they were built for.

pub mod cli;
pub mod core;
pub mod schema;
pub mod yaml;
