mod cli;
mod commands;
mod error;

use crate::cli::Cli;
use crate::commands::{Context, Exit};
use clap::Parser;
use fanout_dispatch::CancellationToken;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).compact().init();
}

/// Cancels `token` on interrupt. Running children are killed and items not
/// yet started are skipped.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; stopping running items");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let context = Context { config_file: cli.config, cancel: CancellationToken::new() };
    cancel_on_interrupt(context.cancel.clone());
    match commands::execute(cli.command, &context).await {
        Ok(exit) => exit.into(),
        Err(err) => {
            eprintln!("fanout: {err}");
            tracing::debug!(error = ?err, "Error details");
            Exit::Setup.into()
        },
    }
}
