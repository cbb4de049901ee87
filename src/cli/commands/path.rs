//! `tfs path` command - Print the directory of an entity

use console::style;
use miette::{IntoDiagnostic, Result};

use crate::cli::helpers::{self, Workspace};
use crate::cli::GlobalOpts;
use crate::schema::Structure;

#[derive(clap::Args, Debug)]
pub struct PathArgs {
    /// Entity as Type:id
    pub entity: String,

    /// Only consult the path cache; fail instead of computing the path
    #[arg(long)]
    pub cached: bool,

    /// Schema to use instead of the configured one (name or name@vN)
    #[arg(long)]
    pub schema: Option<String>,
}

pub fn run(args: PathArgs, global: &GlobalOpts) -> Result<()> {
    let key = helpers::parse_key(&args.entity)?;

    if args.cached {
        let project = helpers::project(global)?;
        let cache = crate::core::PathCache::open(&project)?;
        return match cache.get(&key)? {
            Some(path) => {
                println!("{}", path.display());
                Ok(())
            }
            None => Err(miette::miette!("{} has no verified cached path", key)),
        };
    }

    let ws = Workspace::prepare(global, std::slice::from_ref(&args.entity), args.schema.as_deref())?;
    if let Some(path) = ws.cache.get(&key)? {
        println!("{}", path.display());
        return Ok(());
    }

    // Not materialized yet: report where the schema would put it
    let structure = Structure::render(
        &ws.schema,
        &ws.session,
        &ws.tree,
        ws.project.root(),
        Some(&ws.cache),
    )
    .into_diagnostic()?;
    let found = structure.as_ref().and_then(|s| {
        s.entity_paths()
            .into_iter()
            .find(|(entity, _)| ws.session.key(*entity).as_ref() == Some(&key))
            .map(|(_, path)| path.to_path_buf())
    });

    match found {
        Some(path) => {
            println!("{}", path.display());
            if !global.quiet {
                eprintln!("{} not created yet", style("!").yellow());
            }
            Ok(())
        }
        None => Err(miette::miette!("the schema does not place {} anywhere", key)),
    }
}
