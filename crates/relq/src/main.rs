//! Command-line interface for relq: install queues and run maintenance on them.
//!
//! ## What
//!
//! - Schema management: `install`, `uninstall`, `verify`.
//! - Maintenance: `reset-heartbeats`, `expire`, `errors purge`.
//! - Inspection: `count`, `errors list`, `errors get`.
//!
//! Every command opens the queue with the same transport options the workers use, read from
//! the YAML file given with `--options` (the standard option set otherwise).
//!
//! ### Example
//!
//! ```sh
//! relq --dsn postgresql://localhost/app install emails --options emails.yaml
//! relq --dsn postgresql://localhost/app reset-heartbeats emails --options emails.yaml
//! relq --dsn postgresql://localhost/app errors purge emails --older-than 7d
//! ```
use anyhow::Context;
use clap::{Parser, Subcommand};
use relq::config::Config;
use relq::{PurgeFilter, Queue, TransportOptions};
use std::fs::File;
use std::process;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tokio_util::sync::CancellationToken;

mod output;

use crate::output::{ActionSummary, OutputWriter};

#[derive(Parser)]
#[command(name = "relq")]
#[command(about = "Operate relq work queues")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL (highest priority, overrides all other config sources)
    #[arg(long, short = 'd')]
    dsn: Option<String>,

    /// Config file path (overrides environment variables and defaults)
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Transport options file (YAML) describing the queue
    #[arg(long, global = true)]
    options: Option<String>,

    /// Log destination: stderr or file path
    #[arg(long, default_value = "stderr")]
    log_dest: String,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output format: json, table
    #[arg(long, default_value = "table")]
    format: String,

    /// Output destination: stdout or file path
    #[arg(long, default_value = "stdout")]
    out: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the queue's tables
    Install {
        /// Name of the queue
        queue: String,
    },
    /// Drop the queue's tables
    Uninstall {
        /// Name of the queue
        queue: String,
    },
    /// Check that the queue's tables exist
    Verify {
        /// Name of the queue
        queue: String,
    },
    /// Return abandoned claims to the queue
    ResetHeartbeats {
        /// Name of the queue
        queue: String,
    },
    /// Delete expired messages
    Expire {
        /// Name of the queue
        queue: String,
    },
    /// Show message counts
    Count {
        /// Name of the queue
        queue: String,
    },
    /// Error store commands
    Errors {
        #[command(subcommand)]
        errors_command: ErrorCommands,
    },
}

#[derive(Subcommand)]
enum ErrorCommands {
    /// List quarantined messages
    List {
        /// Name of the queue
        queue: String,

        #[arg(long, default_value = "50")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Show one quarantined message
    Get {
        /// Name of the queue
        queue: String,

        /// Error record id
        id: i64,
    },
    /// Delete quarantined messages
    Purge {
        /// Name of the queue
        queue: String,

        /// Remove records that failed longer ago than this (e.g. '7d', '12h')
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        older_than: Option<String>,

        /// Remove every record
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_dest, &cli.log_level) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }

    if let Err(e) = run_cli(cli).await {
        tracing::error!("Error: {}", e);
        process::exit(1);
    }
}

fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        other => {
            eprintln!("Unknown log level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
    }
}

/// `stderr`, or a file created (truncated) at `dest`.
fn log_writer(dest: &str) -> anyhow::Result<BoxMakeWriter> {
    if dest == "stderr" {
        return Ok(BoxMakeWriter::new(std::io::stderr));
    }
    let file = File::create(dest).with_context(|| format!("Failed to create log file '{}'", dest))?;
    Ok(BoxMakeWriter::new(Mutex::new(file)))
}

fn init_logging(dest: &str, level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_writer(log_writer(dest)?)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to install log subscriber")?;
    Ok(())
}

/// Load configuration, open the queue named by the command and dispatch.
///
/// Configuration priority: `--dsn`, then `--config`, then `RELQ_CONFIG_FILE`, then `RELQ_*`
/// environment variables, then `relq.yaml`/`relq.yml`.
async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_with_options(cli.dsn, cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config.validate()?;

    let options = match &cli.options {
        Some(path) => TransportOptions::from_file(path)?,
        None => TransportOptions::standard(),
    };

    let writer = OutputWriter::from_format(&cli.format);
    let mut out_writer: Box<dyn std::io::Write> = match cli.out.as_str() {
        "stdout" => Box::new(std::io::stdout()),
        _ => Box::new(File::create(&cli.out)?),
    };
    let out: &mut dyn std::io::Write = out_writer.as_mut();

    let open = |name: &str| {
        let config = &config;
        let options = options.clone();
        let name = name.to_string();
        async move { Queue::connect(config, &name, options).await }
    };
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Install { queue } => {
            tracing::info!("Installing queue '{}' ...", queue);
            open(&queue).await?.install().await?;
            tracing::info!("Installation completed successfully");
        }

        Commands::Uninstall { queue } => {
            tracing::info!("Uninstalling queue '{}' ...", queue);
            open(&queue).await?.uninstall().await?;
            tracing::info!("Queue '{}' removed", queue);
        }

        Commands::Verify { queue } => {
            open(&queue).await?.verify().await?;
            tracing::info!("Queue '{}' is installed", queue);
        }

        Commands::ResetHeartbeats { queue } => {
            tracing::info!("Resetting abandoned claims for queue '{}'...", queue);
            let records = open(&queue).await?.heartbeat_monitor().reset(&cancel).await?;
            tracing::info!("Reset {} claims", records.len());
            writer.write_list(&records, out)?;
        }

        Commands::Expire { queue } => {
            let removed = open(&queue)
                .await?
                .expiration_monitor()
                .clear_messages(&cancel)
                .await?;
            writer.write_item(&ActionSummary::new(&queue, "expire", removed), out)?;
        }

        Commands::Count { queue } => {
            let stats = open(&queue).await?.stats().await?;
            writer.write_item(&stats, out)?;
        }

        Commands::Errors { errors_command } => match errors_command {
            ErrorCommands::List {
                queue,
                limit,
                offset,
            } => {
                let records = open(&queue).await?.error_store().list(limit, offset).await?;
                writer.write_list(&records, out)?;
            }

            ErrorCommands::Get { queue, id } => {
                let record = open(&queue)
                    .await?
                    .error_store()
                    .get(id)
                    .await?
                    .ok_or(relq::Error::MessageNotFound { id })?;
                writer.write_item(&record, out)?;
            }

            ErrorCommands::Purge {
                queue,
                older_than,
                all,
            } => {
                let filter = match older_than {
                    Some(age) if !all => {
                        let age = humantime::parse_duration(&age)
                            .map_err(|e| anyhow::anyhow!("Invalid duration format '{}': {}", age, e))?;
                        let age = chrono::Duration::from_std(age)
                            .map_err(|e| anyhow::anyhow!("Duration too large: {}", e))?;
                        PurgeFilter::OlderThan(chrono::Utc::now() - age)
                    }
                    _ => PurgeFilter::All,
                };
                tracing::info!("Purging error records of queue '{}' ({:?})", queue, filter);
                let removed = open(&queue).await?.error_store().clear_messages(filter).await?;
                writer.write_item(&ActionSummary::new(&queue, "purge errors", removed), out)?;
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(parse_level("warn"), tracing::Level::WARN);
        assert_eq!(parse_level("loud"), tracing::Level::INFO);
    }

    #[test]
    fn test_log_writer_reports_bad_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("relq.log");
        let Err(err) = log_writer(missing.to_str().unwrap()) else {
            panic!("log file in a missing directory should fail");
        };
        assert!(err.to_string().contains("Failed to create log file"));

        let ok = dir.path().join("relq.log");
        assert!(log_writer(ok.to_str().unwrap()).is_ok());
        assert!(log_writer("stderr").is_ok());
    }
}
