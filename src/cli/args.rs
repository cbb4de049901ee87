//! CLI argument definitions using clap derive

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::cli::commands::{
    cache::CacheCommands,
    completions::CompletionsArgs,
    context::ContextArgs,
    create::CreateArgs,
    entities::EntitiesArgs,
    init::InitArgs,
    path::PathArgs,
    schema::SchemaCommands,
    tag::{TagArgs, TagsArgs},
};

#[derive(Parser)]
#[command(name = "tfs")]
#[command(author, version, about = "Tessera FS")]
#[command(long_about = "Map production-tracking entity hierarchies onto idempotent directory structures, and back again.")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalOpts,
}

#[derive(clap::Args, Clone, Debug)]
pub struct GlobalOpts {
    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "auto")]
    pub format: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Log every filesystem operation
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Project root (default: auto-detect by finding .tfs/)
    #[arg(long, global = true)]
    pub project: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new TFS project
    Init(InitArgs),

    /// Create the directory structure for entities
    Create(CreateArgs),

    /// Print the directory of an entity
    Path(PathArgs),

    /// Tag a directory with an entity
    Tag(TagArgs),

    /// List the tags of a directory
    Tags(TagsArgs),

    /// List the entities a path belongs to, nearest first
    Entities(EntitiesArgs),

    /// Show the context tree of entities
    Context(ContextArgs),

    /// Path cache management
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Schema inspection
    #[command(subcommand)]
    Schema(SchemaCommands),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Table for terminals, TSV otherwise
    #[default]
    Auto,
    /// Aligned table
    Table,
    /// Tab-separated values (for piping)
    Tsv,
    /// JSON format (for programming)
    Json,
    /// YAML format
    Yaml,
}

impl OutputFormat {
    /// Resolve `auto` against whether stdout is a terminal
    pub fn resolve(self) -> OutputFormat {
        match self {
            OutputFormat::Auto if console::Term::stdout().is_term() => OutputFormat::Table,
            OutputFormat::Auto => OutputFormat::Tsv,
            other => other,
        }
    }
}
