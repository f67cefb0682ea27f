mod cli;
mod cmd;
mod dispatch;
mod signal;

use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use stowage_core::config::{self, StowageConfig};

use cli::Cli;
use dispatch::{dispatch_command, exit_code, EXIT_PRECONDITION};

fn level_for(verbose: u8) -> &'static str {
    ["warn", "info", "debug"]
        .get(usize::from(verbose))
        .copied()
        .unwrap_or("trace")
}

/// Config for commands that talk to the store. The error carries the
/// message already printed to stderr.
fn config_for(cli: &Cli) -> Result<Option<StowageConfig>, ()> {
    if !cli.command.needs_config() {
        return Ok(None);
    }
    let source = match config::resolve_config_path(cli.config.as_deref()) {
        Some(source) => source,
        None => {
            let searched: Vec<String> = config::default_config_search_paths()
                .into_iter()
                .map(|(path, level)| format!("  {} ({level})", path.display()))
                .collect();
            eprintln!(
                "Error: no configuration file found.\nSearched:\n{}",
                searched.join("\n")
            );
            return Err(());
        }
    };
    info!("Using config: {source}");
    config::load_config(source.path()).map(Some).map_err(|e| {
        eprintln!("Error: {e}");
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(level_for(cli.verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Ok(loaded) = config_for(&cli) else {
        return ExitCode::from(EXIT_PRECONDITION);
    };

    signal::install_signal_handlers();
    let outcome = dispatch_command(&cli.command, loaded.as_ref(), Some(&signal::SHUTDOWN));
    if signal::requested() {
        info!("stop signal received");
    }
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {} failed: {e}", cli.command.name());
            ExitCode::from(exit_code(e.as_ref()))
        }
    }
}
