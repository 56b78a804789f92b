//! tedsync CLI: download TED daily packages and load them into a search index.
//!
//! Resolves the publication calendar, fetches released packages, normalizes
//! their XML notices and bulk loads them, tracking completed publications so
//! re-runs only do the missing work.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    // Must run before parsing so `.env` values feed the clap env fallbacks
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
