//! Conductor CLI entry point.
//!
//! Binary name: `conductor`
//!
//! Parses CLI arguments, sets up tracing, builds the engine from the data
//! directory, and dispatches to the command handlers.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use conductor_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::run::RunArgs;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Shell completions don't need the engine
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "conductor", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let format = if cli.json { LogFormat::Json } else { LogFormat::Pretty };
    let tracing_options = TracingOptions::for_verbosity(cli.verbose, cli.quiet)
        .with_format(format)
        .with_otel(cli.otel);
    if let Err(e) = init_tracing(&tracing_options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let state = AppState::init(cli.data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Run {
            file,
            vars,
            env,
            max_concurrency,
            run_id,
            dry_run,
        } => {
            let args = RunArgs {
                file: &file,
                vars: &vars,
                env: &env,
                max_concurrency,
                run_id,
                dry_run,
            };
            cli::run::handle_run(&state, args, json).await
        }

        Commands::Resume {
            run_id,
            file,
            reason,
            max_concurrency,
        } => cli::run::handle_resume(&state, &run_id, &file, reason, max_concurrency, json).await,

        Commands::States => {
            cli::runs::list_states(&state, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Show { run_id, logs } => {
            cli::runs::show_state(&state, &run_id, logs, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Delete { run_id } => {
            cli::runs::delete_state(&state, &run_id, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Cleanup { max_age_secs } => {
            cli::runs::cleanup_states(&state, max_age_secs, json).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}
