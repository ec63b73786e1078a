use crate::core::{
    api::{HttpPipelineApi, PipelineApi},
    config::{AppConfig, CONFIG_KEYS, ConfigService, TOKEN_ENV},
    error::ErrorLogReader,
    estimator,
    models::{DataPath, RunRecord, validate_connection_id, validate_since_date},
    notifier::Notifier,
    tracker::{ChannelKind, JobTracker, SyncSnapshot, SyncStart, SyncStatus},
};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "sentimenta-sync")]
#[command(about = "Start and track comment sync runs.", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Sets a custom data path
    #[arg(long, value_name = "DIR")]
    pub data_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a sync for a connection and follow it until it finishes
    Sync {
        /// The connection to sync
        connection_id: String,
        /// Maximum number of posts to fetch (1-200)
        #[arg(long)]
        max_posts: Option<u32>,
        /// Maximum number of comments per post (10-1000)
        #[arg(long)]
        max_comments: Option<u32>,
        /// Only fetch posts published since this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
    },
    /// List recent pipeline runs
    Runs {
        /// Only show runs of this connection
        #[arg(long)]
        connection: Option<String>,
    },
    /// Show the status of one run
    Status {
        /// The run id
        run_id: String,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect the error log
    Errors {
        #[command(subcommand)]
        command: Option<ErrorCommands>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Get a configuration value
    Get {
        /// The key to get
        key: String,
    },
    /// Set a configuration value
    Set {
        /// The key to set
        key: String,
        /// The value to set
        value: String,
    },
}

#[derive(Subcommand)]
pub enum ErrorCommands {
    /// Show the most recent errors
    List {
        /// Number of entries to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Only show errors for this connection
        #[arg(long)]
        connection: Option<String>,
    },
    /// Show error counts per operation
    Stats,
    /// Delete the error log
    Clear,
}

/// Prints the outcome of a sync to the terminal
struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn success(&self, note: &str) {
        println!("✅ Analysis complete: {note}");
    }

    fn failure(&self, note: &str) {
        println!("❌ Sync failed: {note}");
    }
}

fn create_api(data_path: &DataPath) -> io::Result<(AppConfig, Arc<HttpPipelineApi>)> {
    let config = ConfigService::load_effective(data_path)?;
    if !config.api.is_configured() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "No API token configured. Run 'sentimenta-sync config set token <TOKEN>' or set {TOKEN_ENV}."
            ),
        ));
    }

    let api = HttpPipelineApi::new(config.api.clone())?.with_error_log(data_path.error_log_path());
    Ok((config, Arc::new(api)))
}

pub async fn handle_sync_command(
    data_path: &DataPath,
    connection_id: &str,
    max_posts: Option<u32>,
    max_comments: Option<u32>,
    since: &Option<String>,
) -> io::Result<()> {
    validate_connection_id(connection_id)?;
    let (config, api) = create_api(data_path)?;

    let mut params = config.sync.clone();
    if let Some(max_posts) = max_posts {
        params.max_posts = max_posts;
    }
    if let Some(max_comments) = max_comments {
        params.max_comments_per_post = max_comments;
    }
    if let Some(since) = since {
        validate_since_date(since)?;
        params.since_date = since.clone();
    }
    let params = params.normalized();

    let mut tracker = JobTracker::new(
        connection_id,
        api,
        Arc::new(TerminalNotifier),
        config.tracking.tracker_settings(),
    );
    let mut updates = tracker.subscribe();

    match tracker.sync(&params).await {
        Ok(SyncStart::Started { task_id }) => {
            println!(
                "Sync started for {connection_id} (task {task_id}, up to {} posts, {} comments per post)",
                params.max_posts, params.max_comments_per_post
            );
        }
        Ok(SyncStart::AlreadyInFlight) => {
            println!("A sync for {connection_id} is already running.");
            return Ok(());
        }
        Err(e) => {
            error!("Failed to start sync for {connection_id}: {e}");
            return Err(e.into());
        }
    }

    let mut last_line = String::new();
    let snapshot = loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break tracker.snapshot();
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.status.is_terminal() {
                    break snapshot;
                }
                let line = render_snapshot(&snapshot);
                if line != last_line {
                    println!("{line}");
                    io::stdout().flush()?;
                    last_line = line;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracker.dispose();
                println!("\nStopped tracking. The run continues on the server.");
                println!("Use 'sentimenta-sync runs --connection {connection_id}' to check on it.");
                return Ok(());
            }
        }
    };

    match snapshot.status {
        SyncStatus::Done => {
            info!("Sync for {connection_id} completed");
            Ok(())
        }
        _ => Err(io::Error::other(snapshot.status_text)),
    }
}

fn render_snapshot(snapshot: &SyncSnapshot) -> String {
    let via = match snapshot.channel {
        ChannelKind::Live => " (live)",
        ChannelKind::Polling => " (polling)",
        ChannelKind::None => "",
    };
    format!(
        "[{:>3}%] {}{via}",
        snapshot.progress_percent, snapshot.status_text
    )
}

pub async fn handle_runs_command(
    data_path: &DataPath,
    connection: &Option<String>,
) -> io::Result<()> {
    let (_, api) = create_api(data_path)?;
    let runs: Vec<RunRecord> = api
        .list_runs()
        .await?
        .into_iter()
        .filter(|run| {
            connection
                .as_deref()
                .is_none_or(|id| run.connection_id.as_deref() == Some(id))
        })
        .collect();

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!("Runs ({}):", runs.len());
    println!("{}", "=".repeat(20));
    for run in &runs {
        let account = match (&run.platform, &run.connection_username) {
            (Some(platform), Some(username)) => format!("{platform}/@{username}"),
            _ => run.connection_id.clone().unwrap_or_else(|| "-".to_string()),
        };
        println!(
            "• {} {} [{}] {} posts, {}/{} comments analyzed, ${:.4} - {}",
            run.started_at.format("%Y-%m-%d %H:%M"),
            account,
            run.status.as_str(),
            run.posts_fetched,
            run.comments_analyzed,
            run.comments_fetched,
            run.total_cost_usd,
            run.id
        );
        if let Some(notes) = run.notes.as_deref().filter(|n| !n.is_empty()) {
            println!("    {notes}");
        }
    }

    Ok(())
}

pub async fn handle_status_command(data_path: &DataPath, run_id: &str) -> io::Result<()> {
    let (_, api) = create_api(data_path)?;
    let status = api.run_status(run_id).await?;

    println!("Run {run_id}: {}", status.status.as_str());
    println!("Posts fetched:      {}", status.posts_fetched);
    println!("Comments fetched:   {}", status.comments_fetched);
    println!("Comments analyzed:  {}", status.comments_analyzed);
    println!("Errors:             {}", status.errors_count);
    if !status.status.is_terminal() {
        println!(
            "Progress:           {}%",
            estimator::estimate(status.comments_fetched, status.comments_analyzed)
        );
    }

    Ok(())
}

pub fn handle_config_command(
    data_path: &DataPath,
    command: &Option<ConfigCommands>,
) -> io::Result<()> {
    match command {
        Some(ConfigCommands::Get { key }) => {
            let config = ConfigService::load_config(data_path)?;
            let value = ConfigService::get_value(&config, key)?;
            println!("{key}: {value}");
        }
        Some(ConfigCommands::Set { key, value }) => {
            let mut config = ConfigService::load_config(data_path)?;
            if let Err(e) = ConfigService::set_value(&mut config, key, value) {
                error!("Invalid configuration value for {key}: {e}");
                return Err(e);
            }
            ConfigService::save_config(&config, data_path)?;
            info!("Updated {key} configuration");
            println!("{key} set to: {}", ConfigService::get_value(&config, key)?);
            println!("Config file: {}", data_path.config_path().display());
        }
        None => {
            let config = ConfigService::load_config(data_path)?;
            println!("Current Configuration:");
            println!("======================");
            for key in CONFIG_KEYS {
                println!("{key}: {}", ConfigService::get_value(&config, key)?);
            }
            println!();
            println!("Config file: {}", data_path.config_path().display());
        }
    }
    Ok(())
}

pub fn handle_errors_command(
    data_path: &DataPath,
    command: &Option<ErrorCommands>,
) -> io::Result<()> {
    let log_path = data_path.error_log_path();

    match command {
        Some(ErrorCommands::List { limit, connection }) => {
            let errors = ErrorLogReader::read_recent_errors(&log_path, *limit, connection.as_deref())
                .map_err(io::Error::other)?;
            if errors.is_empty() {
                println!("No errors found.");
                return Ok(());
            }

            println!("Recent errors ({}):", errors.len());
            println!("{}", "=".repeat(20));
            for entry in &errors {
                println!(
                    "• {} {} [{}] {}",
                    entry.timestamp, entry.operation, entry.error_type, entry.error_message
                );
                if let Some(target) = &entry.target_id {
                    println!("    connection: {target}");
                }
                if let Some(url) = &entry.request_url {
                    match entry.status_code {
                        Some(code) => println!("    {url} -> {code}"),
                        None => println!("    {url}"),
                    }
                }
            }
        }
        Some(ErrorCommands::Stats) => {
            let stats = ErrorLogReader::get_error_stats(&log_path).map_err(io::Error::other)?;
            if stats.is_empty() {
                println!("No error statistics available.");
                return Ok(());
            }

            let mut operations: Vec<_> = stats.into_iter().collect();
            operations.sort_by(|a, b| b.1.total_errors.cmp(&a.1.total_errors));
            for (operation, stat) in operations {
                println!("{operation}: {} error(s)", stat.total_errors);
                let mut types: Vec<_> = stat.error_types.into_iter().collect();
                types.sort();
                for (error_type, count) in types {
                    println!("    {error_type}: {count}");
                }
                if let Some(last) = stat.last_error_time {
                    println!("    last: {last}");
                }
            }
        }
        Some(ErrorCommands::Clear) => {
            if !log_path.exists() {
                println!("No error log file found.");
                return Ok(());
            }
            std::fs::remove_file(&log_path)?;
            info!("Cleared error log {}", log_path.display());
            println!("Error log cleared.");
        }
        None => {
            println!("Available error commands:");
            println!("  list   Show the most recent errors");
            println!("  stats  Show error counts per operation");
            println!("  clear  Delete the error log");
            println!();
            println!("Error log: {}", log_path.display());
        }
    }
    Ok(())
}
