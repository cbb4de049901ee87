//! `tfs entities` command - Map a path back to its entities

use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

use crate::cli::helpers;
use crate::cli::GlobalOpts;
use crate::core::{tags, Config, Project, Session};

#[derive(clap::Args, Debug)]
pub struct EntitiesArgs {
    /// Path inside a tagged directory (default: current directory)
    #[arg(default_value = ".")]
    pub path: PathBuf,
}

pub fn run(args: EntitiesArgs, global: &GlobalOpts) -> Result<()> {
    // Tags are self-describing, so a project is optional here
    let project = match &global.project {
        Some(_) => Some(helpers::project(global)?),
        None => Project::discover_from(&args.path).ok(),
    };
    let config = Config::load_for(project.as_ref());
    let mut session: Session = Session::new().with_parent_fields(config.parent_fields());

    let entities = tags::entities_from_path(&mut session, &args.path).into_diagnostic()?;
    let rows: Vec<Vec<String>> = entities
        .iter()
        .map(|&entity| {
            vec![
                session.entity_type(entity).unwrap_or_default().to_string(),
                helpers::id_text(session.key(entity)),
                session.default_name(entity),
            ]
        })
        .collect();

    helpers::print_rows(global.format, &["type", "id", "name"], &rows)
}
