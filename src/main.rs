//! wrn-nas - command-line entry point

use clap::Parser;
use wide_resnet_nas::cli::{
    cmd_evaluate, cmd_info, cmd_load_combination, cmd_load_gumbel, cmd_train, Cli, Commands,
};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wide_resnet_nas=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { model } => {
            cmd_info(&model)?;
        }
        Commands::Train { model, data, epochs, batch_size, lr, output, candidate, weights } => {
            cmd_train(
                &model,
                &data,
                epochs,
                batch_size,
                lr,
                output.as_deref(),
                candidate,
                weights.as_deref(),
            )?;
        }
        Commands::Evaluate { model, data, weights, batch_size } => {
            cmd_evaluate(&model, &data, &weights, batch_size)?;
        }
        Commands::LoadGumbel { model, weights, alphas, data, output } => {
            cmd_load_gumbel(&model, &weights, alphas.as_deref(), data.as_deref(), output.as_deref())?;
        }
        Commands::LoadCombination { model, weights, indices, table, data, output } => {
            cmd_load_combination(
                &model,
                &weights,
                &indices,
                table,
                data.as_deref(),
                output.as_deref(),
            )?;
        }
    }

    Ok(())
}
