//! YAML helpers shared by schema and config loading

pub mod diagnostics;

pub use diagnostics::YamlSyntaxError;
