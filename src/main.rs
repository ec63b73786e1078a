mod cli;
mod core;
#[cfg(test)]
mod test_fixtures;

use crate::cli::{Cli, Commands};
use crate::core::models::DataPath;
use clap::Parser;
use std::io;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let data_path = DataPath::new(cli.data_path.clone())?;

    match &cli.command {
        Commands::Sync {
            connection_id,
            max_posts,
            max_comments,
            since,
        } => {
            cli::handle_sync_command(&data_path, connection_id, *max_posts, *max_comments, since)
                .await
        }
        Commands::Runs { connection } => cli::handle_runs_command(&data_path, connection).await,
        Commands::Status { run_id } => cli::handle_status_command(&data_path, run_id).await,
        Commands::Config { command } => cli::handle_config_command(&data_path, command),
        Commands::Errors { command } => cli::handle_errors_command(&data_path, command),
    }
}
