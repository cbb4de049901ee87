//! `tfs cache` command - Manage the path cache
//!
//! The cache is a SQLite database under `.tfs/` mapping entities to the
//! directories built for them. It is derived data: `rebuild` re-indexes it
//! from the tag sidecars found under the project root.

use clap::Subcommand;
use console::style;
use miette::Result;
use std::path::PathBuf;

use crate::cli::helpers;
use crate::cli::GlobalOpts;
use crate::core::cache::CACHE_FILE;
use crate::core::{PathCache, Session};

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Rebuild the cache from the tags on disk
    Rebuild,

    /// Show cache statistics
    Status,

    /// List cached paths
    List {
        /// Only entities of this type
        #[arg(long = "type", short = 't')]
        entity_type: Option<String>,

        /// Only paths at or below this directory
        #[arg(long)]
        under: Option<PathBuf>,

        /// Skip rows whose directory no longer exists
        #[arg(long)]
        fresh: bool,
    },

    /// Remove every cached path
    Clear,
}

pub fn run(cmd: CacheCommands, global: &GlobalOpts) -> Result<()> {
    match cmd {
        CacheCommands::Rebuild => run_rebuild(global),
        CacheCommands::Status => run_status(global),
        CacheCommands::List {
            entity_type,
            under,
            fresh,
        } => run_list(global, entity_type.as_deref(), under, fresh),
        CacheCommands::Clear => run_clear(global),
    }
}

fn run_rebuild(global: &GlobalOpts) -> Result<()> {
    let project = helpers::project(global)?;
    let mut cache = PathCache::open(&project)?;

    if !global.quiet {
        println!("{} Rebuilding cache...", style("→").blue());
    }
    let stats = cache.rebuild()?;

    if !global.quiet {
        println!(
            "{} Cache rebuilt in {}ms",
            style("✓").green(),
            stats.duration_ms
        );
        println!("  Directories scanned: {}", stats.dirs_scanned);
        println!("  Entities indexed:    {}", stats.entries_indexed);
        if stats.duplicates > 0 {
            println!(
                "  Duplicate tags:      {}",
                style(stats.duplicates).yellow()
            );
        }
        if stats.unreadable > 0 {
            println!("  Unreadable tags:     {}", style(stats.unreadable).red());
        }
    }
    Ok(())
}

fn run_status(global: &GlobalOpts) -> Result<()> {
    let project = helpers::project(global)?;
    let cache = PathCache::open(&project)?;
    let stats = cache.statistics()?;

    println!("{}", style("Cache Status").bold());
    println!("{}", style("─".repeat(40)).dim());
    println!(
        "  Location:       {}",
        project.root().join(CACHE_FILE).display()
    );
    println!("  Total entries:  {}", style(stats.total_entries).cyan());
    println!(
        "  Database size:  {} KB",
        style(stats.db_size_bytes / 1024).cyan()
    );

    if !stats.by_type.is_empty() {
        println!();
        println!("  {}", style("By Type:").bold());
        for (entity_type, count) in &stats.by_type {
            println!("    {:<12} {}", entity_type, count);
        }
    }
    Ok(())
}

fn run_list(
    global: &GlobalOpts,
    entity_type: Option<&str>,
    under: Option<PathBuf>,
    fresh: bool,
) -> Result<()> {
    let project = helpers::project(global)?;
    let cache = PathCache::open(&project)?;
    let mut session = Session::new();

    let under = match under {
        Some(dir) => dir.canonicalize().unwrap_or(dir),
        None => cache.root().to_path_buf(),
    };
    let rows: Vec<Vec<String>> = cache
        .walk(&mut session, &under, entity_type, fresh)?
        .into_iter()
        .map(|(path, entity)| {
            vec![
                session.entity_type(entity).unwrap_or_default().to_string(),
                helpers::id_text(session.key(entity)),
                path.display().to_string(),
            ]
        })
        .collect();

    helpers::print_rows(global.format, &["type", "id", "path"], &rows)
}

fn run_clear(global: &GlobalOpts) -> Result<()> {
    let project = helpers::project(global)?;
    let mut cache = PathCache::open(&project)?;
    let count = cache.statistics()?.total_entries;
    cache.clear()?;

    if !global.quiet {
        println!("{} Cache cleared ({} entries)", style("✓").green(), count);
    }
    Ok(())
}
