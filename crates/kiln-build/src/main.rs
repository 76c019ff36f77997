//! Kiln CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;

use kiln_build::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    cli.init_tracing()?;
    cli.execute().await
}
