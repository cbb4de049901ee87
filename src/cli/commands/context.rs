//! `tfs context` command - Show how entities connect to their project

use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

use crate::cli::helpers;
use crate::cli::GlobalOpts;
use crate::core::{context_from_path, Config, ContextTree};

#[derive(clap::Args, Debug)]
pub struct ContextArgs {
    /// Entities as Type:id
    #[arg(required_unless_present = "path")]
    pub entities: Vec<String>,

    /// Build the context from the tags around a path instead
    #[arg(long, conflicts_with = "entities")]
    pub path: Option<PathBuf>,
}

pub fn run(args: ContextArgs, global: &GlobalOpts) -> Result<()> {
    let project = helpers::project(global)?;
    let config = Config::load_for(Some(&project));

    let (session, tree) = match &args.path {
        Some(path) => {
            let mut session = crate::core::Session::new().with_parent_fields(config.parent_fields());
            let tree = context_from_path(&mut session, path).into_diagnostic()?;
            (session, tree)
        }
        None => {
            let mut session = helpers::session(&config)?;
            let entities = helpers::load_entities(&mut session, &args.entities)?;
            let tree = ContextTree::build(&mut session, &entities).into_diagnostic()?;
            let nodes: Vec<_> = tree.iter().map(|id| tree.entity(id)).collect();
            session.load_all(&nodes).into_diagnostic()?;
            (session, tree)
        }
    };

    print!("{}", tree.dump(&session));
    Ok(())
}
