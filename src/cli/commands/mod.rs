//! CLI command implementations

pub mod cache;
pub mod completions;
pub mod context;
pub mod create;
pub mod entities;
pub mod init;
pub mod path;
pub mod schema;
pub mod tag;
