//! `irs`: crawl item relationship graphs from the command line.
//!
//! Runs single jobs or batch orders against stub or live collaborators and
//! prints the result as JSON.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
