use clap::Parser;
use miette::Result;
use tfs::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Reset SIGPIPE to default behavior (terminate silently) for proper Unix piping.
    // Without this, piping to `head`, `grep -q`, etc. causes a panic on broken pipe.
    #[cfg(unix)]
    {
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        }
    }
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .tab_width(4)
                .build(),
        )
    }))?;

    let cli = Cli::parse();
    let global = cli.global;

    // RUST_LOG wins over --verbose
    let default_level = if global.verbose { "tfs=info" } else { "tfs=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Commands::Init(args) => tfs::cli::commands::init::run(args),
        Commands::Create(args) => tfs::cli::commands::create::run(args, &global),
        Commands::Path(args) => tfs::cli::commands::path::run(args, &global),
        Commands::Tag(args) => tfs::cli::commands::tag::run_tag(args, &global),
        Commands::Tags(args) => tfs::cli::commands::tag::run_tags(args, &global),
        Commands::Entities(args) => tfs::cli::commands::entities::run(args, &global),
        Commands::Context(args) => tfs::cli::commands::context::run(args, &global),
        Commands::Cache(cmd) => tfs::cli::commands::cache::run(cmd, &global),
        Commands::Schema(cmd) => tfs::cli::commands::schema::run(cmd, &global),
        Commands::Completions(args) => tfs::cli::commands::completions::run(args),
    }
}
