//! `tfs schema` command - Inspect folder schemas

use clap::Subcommand;
use console::style;
use miette::Result;

use crate::cli::helpers;
use crate::cli::GlobalOpts;
use crate::core::{Config, Project};
use crate::schema::{Schema, SchemaRegistry};

#[derive(Subcommand, Debug)]
pub enum SchemaCommands {
    /// List the schemas every resolver can provide
    List,

    /// Show the outline of a schema
    Show(ShowArgs),
}

#[derive(clap::Args, Debug)]
pub struct ShowArgs {
    /// Schema name, optionally pinned as name@vN (default: configured schema)
    pub name: Option<String>,

    /// Entity type the outline starts from
    #[arg(long, default_value = "Project")]
    pub root: String,
}

pub fn run(cmd: SchemaCommands, global: &GlobalOpts) -> Result<()> {
    // Bundled schemas work outside a project too
    let project = match &global.project {
        Some(_) => Some(helpers::project(global)?),
        None => Project::discover().ok(),
    };
    let config = Config::load_for(project.as_ref());
    let registry = SchemaRegistry::for_project(project.as_ref(), &config);

    match cmd {
        SchemaCommands::List => {
            let rows: Vec<Vec<String>> = registry
                .available()
                .into_iter()
                .map(|(source, name)| vec![name, source])
                .collect();
            helpers::print_rows(global.format, &["name", "source"], &rows)
        }
        SchemaCommands::Show(args) => {
            let name = args.name.as_deref().unwrap_or_else(|| config.schema());
            let dir = registry.resolve(name)?;
            let schema = Schema::load(&dir, &args.root, &config.template_ignore())?;
            if !global.quiet {
                eprintln!("{} {}", style(name).bold(), style(dir.display()).dim());
            }
            print!("{}", schema.outline());
            Ok(())
        }
    }
}
