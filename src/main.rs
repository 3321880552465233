use clap::Parser;
use tracing_subscriber::EnvFilter;

use bigfile::cli::{self, Cli, Command};

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("bigfile=info".parse().expect("valid log directive"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Ls { path } => cli::ls(&path)?,
        Command::Header { path, block } => cli::header(&path, &block)?,
        Command::Attrs { path, block } => cli::attrs(&path, &block)?,
        Command::Cat {
            path,
            block,
            start,
            count,
        } => cli::cat(&path, &block, start, count)?,
    }

    Ok(())
}
