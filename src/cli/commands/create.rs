//! `tfs create` command - Build the directory structure for entities

use console::style;
use miette::{IntoDiagnostic, Result};

use crate::cli::helpers::Workspace;
use crate::cli::GlobalOpts;
use crate::schema::{DryRunProcessor, FsProcessor, Structure, StructureKind};

#[derive(clap::Args, Debug)]
pub struct CreateArgs {
    /// Entities to build, as Type:id (e.g. Shot:1234)
    #[arg(required = true)]
    pub entities: Vec<String>,

    /// Show what would be created without touching the disk
    #[arg(long, short = 'n')]
    pub dry_run: bool,

    /// Schema to use instead of the configured one (name or name@vN)
    #[arg(long)]
    pub schema: Option<String>,
}

pub fn run(args: CreateArgs, global: &GlobalOpts) -> Result<()> {
    let mut ws = Workspace::prepare(global, &args.entities, args.schema.as_deref())?;

    let structure = Structure::render(
        &ws.schema,
        &ws.session,
        &ws.tree,
        ws.project.root(),
        Some(&ws.cache),
    )
    .into_diagnostic()?;
    let Some(structure) = structure else {
        let root = ws.session.describe(ws.tree.entity(ws.tree.root()));
        return Err(miette::miette!("schema does not apply to {}", root));
    };

    if args.dry_run {
        let mut dry = DryRunProcessor::new();
        structure.process(&mut dry).into_diagnostic()?;
        for op in dry.operations() {
            println!("{}", op);
        }
        if !global.quiet {
            eprintln!(
                "{} {} operation(s), nothing written",
                style("→").blue(),
                dry.operations().len()
            );
        }
        return Ok(());
    }

    let verbose = global.verbose || ws.config.verbose();
    let stats = {
        let mut processor = FsProcessor::new().verbose(verbose).with_cache(&mut ws.cache);
        structure.process(&mut processor).into_diagnostic()?;
        processor.stats()
    };

    if !global.quiet {
        for node in structure.nodes() {
            if let StructureKind::Entity { entity, reused, .. } = &node.kind {
                let marker = if *reused { style("=").dim() } else { style("+").green() };
                println!(
                    "{} {:<24} {}",
                    marker,
                    ws.session.describe(*entity),
                    node.path.display()
                );
            }
        }
        if stats.mutations() == 0 {
            println!("{} Everything already exists", style("✓").green());
        } else {
            println!(
                "{} Created {} director{}, {} file(s); added {} tag(s)",
                style("✓").green(),
                stats.dirs_created,
                if stats.dirs_created == 1 { "y" } else { "ies" },
                stats.files_touched + stats.files_copied,
                stats.tags_added
            );
        }
    }

    Ok(())
}
