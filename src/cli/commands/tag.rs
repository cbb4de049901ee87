//! `tfs tag` / `tfs tags` commands - Manage directory tags by hand

use console::style;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

use crate::cli::helpers;
use crate::cli::GlobalOpts;
use crate::core::{tags, Config, PathCache};

#[derive(clap::Args, Debug)]
pub struct TagArgs {
    /// Directory to tag
    pub dir: PathBuf,

    /// Entity as Type:id
    pub entity: String,

    /// Remove the tag instead of adding it
    #[arg(long)]
    pub remove: bool,
}

#[derive(clap::Args, Debug)]
pub struct TagsArgs {
    /// Directory to inspect (default: current directory)
    #[arg(default_value = ".")]
    pub dir: PathBuf,
}

pub fn run_tag(args: TagArgs, global: &GlobalOpts) -> Result<()> {
    let project = helpers::project(global)?;
    let dir = args.dir.canonicalize().into_diagnostic()?;
    if !dir.is_dir() {
        return Err(miette::miette!("{} is not a directory", dir.display()));
    }

    let mut cache = PathCache::open(&project)?;

    if args.remove {
        let key = helpers::parse_key(&args.entity)?;
        let removed = tags::remove_tag(&dir, &key).into_diagnostic()?;
        if cache.cached_path(&key)?.as_deref() == Some(dir.as_path()) {
            cache.delete(&key)?;
        }
        if !global.quiet {
            if removed > 0 {
                println!("{} Removed {} from {}", style("✓").green(), key, dir.display());
            } else {
                println!("{} {} was not tagged", style("!").yellow(), dir.display());
            }
        }
        return Ok(());
    }

    let config = Config::load_for(Some(&project));
    let mut session = helpers::session(&config)?;
    let entity = helpers::load_entities(&mut session, std::slice::from_ref(&args.entity))?[0];
    let key = session
        .key(entity)
        .ok_or_else(|| miette::miette!("{} has no id", args.entity))?;

    let added = tags::add_tag(&dir, &session.to_tag(entity)).into_diagnostic()?;
    cache.put(&key, &dir)?;

    if !global.quiet {
        if added {
            println!(
                "{} Tagged {} as {}",
                style("✓").green(),
                dir.display(),
                session.describe(entity)
            );
        } else {
            println!("{} Already tagged as {}", style("✓").green(), session.describe(entity));
        }
    }
    Ok(())
}

pub fn run_tags(args: TagsArgs, global: &GlobalOpts) -> Result<()> {
    let tags = tags::read_tags(&args.dir).into_diagnostic()?;

    let rows: Vec<Vec<String>> = tags
        .iter()
        .map(|tag| {
            let text = |field: &str| {
                tag.entity
                    .get(field)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            vec![
                text("type"),
                helpers::id_text(tag.key()),
                {
                    let code = text("code");
                    if code.is_empty() { text("name") } else { code }
                },
                tag.created_at.to_rfc3339(),
            ]
        })
        .collect();

    helpers::print_rows(global.format, &["type", "id", "name", "created_at"], &rows)
}
