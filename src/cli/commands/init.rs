//! `tfs init` command - Initialize a new TFS project

use console::style;
use miette::{IntoDiagnostic, Result};
use std::path::Path;

use crate::core::project::{Project, ProjectError};

#[derive(clap::Args, Debug)]
pub struct InitArgs {
    /// Directory to initialize (default: current directory)
    #[arg(default_value = ".")]
    pub path: std::path::PathBuf,

    /// Force initialization even if .tfs/ already exists
    #[arg(long)]
    pub force: bool,
}

pub fn run(args: InitArgs) -> Result<()> {
    let path = if args.path.as_os_str() == "." {
        std::env::current_dir().into_diagnostic()?
    } else {
        args.path.clone()
    };

    // Create directory if it doesn't exist
    if !path.exists() {
        std::fs::create_dir_all(&path).into_diagnostic()?;
        println!(
            "{} Created directory {}",
            style("✓").green(),
            style(path.display()).cyan()
        );
    }

    let project = if args.force {
        Project::init_force(&path)
    } else {
        Project::init(&path)
    };

    match project {
        Ok(project) => {
            println!(
                "{} Initialized TFS project at {}",
                style("✓").green(),
                style(project.root().display()).cyan()
            );
            println!();
            print_structure(project.root());
            println!();
            println!("Next steps:");
            println!(
                "  {} Point 'records' at your tracking data",
                style("edit .tfs/config.yaml").yellow()
            );
            println!(
                "  {} Build the directories for an entity",
                style("tfs create Shot:1234").yellow()
            );
            println!(
                "  {} Preview without touching the disk",
                style("tfs create --dry-run Shot:1234").yellow()
            );
            Ok(())
        }
        Err(ProjectError::AlreadyExists(path)) => {
            println!(
                "{} TFS project already exists at {}",
                style("!").yellow(),
                style(path.display()).cyan()
            );
            println!();
            println!("Use {} to reinitialize", style("tfs init --force").yellow());
            Ok(())
        }
        Err(e) => Err(miette::miette!("{}", e)),
    }
}

fn print_structure(root: &Path) {
    for entry in [".tfs/", ".tfs/config.yaml", ".tfs/schemas/"] {
        if root.join(entry).exists() {
            println!("  {}", style(entry).dim());
        }
    }
}
