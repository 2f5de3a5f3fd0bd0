//! Cadence CLI entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, initializes tracing and application state, then
//! dispatches to the appropriate command handler.

mod cli;
mod generator;
mod state;

use clap::Parser;
use clap_complete::generate;

use cadence_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use cadence_types::run::TenantId;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions::from_verbosity(cli.verbose, cli.quiet)
        .with_json(cli.log_json)
        .with_otel(cli.otel);
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't need app state
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "cadence", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::pipeline::handle_validate(file, cli.json),
        _ => {}
    }

    let state = AppState::init(TenantId::new(cli.tenant.clone())).await?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Submit {
            pipeline,
            config,
            config_file,
            no_drive,
        } => {
            cli::run::handle_submit(
                &state,
                &pipeline,
                config.as_deref(),
                config_file.as_deref(),
                no_drive,
                json,
            )
            .await
        }
        Commands::Drive { run_id } => cli::run::handle_drive(&state, &run_id, json).await,
        Commands::Signal {
            run_id,
            delivery_id,
            no_drive,
            signal,
        } => {
            cli::signal::handle_signal(
                &state,
                &run_id,
                delivery_id.as_deref(),
                signal,
                no_drive,
                json,
            )
            .await
        }
        Commands::Status { run_id, limit } => {
            cli::run::handle_status(&state, run_id.as_deref(), limit, json).await
        }
        Commands::Steps { run_id, attempts } => {
            cli::run::handle_steps(&state, &run_id, attempts, json).await
        }
        Commands::Resume {
            run_id,
            stage,
            no_drive,
        } => cli::run::handle_resume(&state, &run_id, &stage, no_drive, json).await,
        Commands::Delete { run_id } => cli::run::handle_delete(&state, &run_id, json).await,
        Commands::Recover => cli::run::handle_recover(&state, json).await,
        Commands::Pipelines => cli::pipeline::handle_list(&state, json),
        Commands::Completions { .. } | Commands::Validate { .. } => unreachable!("handled above"),
    };

    state.shutdown();
    result
}
