//! rolloutctl - drive Trident A/B updates on remote hosts

use clap::Parser;
use rolloutctl::cli::Cli;
use rolloutctl::{commands, exit_code, logging};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match commands::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
