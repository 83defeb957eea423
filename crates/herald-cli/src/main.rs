//! Herald CLI tool.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use herald_core::JobStatus;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Herald outbox admin CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "HERALD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and manage outbox jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Enqueue a job
    Enqueue {
        /// Job type, e.g. webhook
        job_type: String,
        /// JSON object payload
        payload: String,
        /// Earliest run time (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Validate a system configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "herald.kdl")]
        path: String,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        /// Filter by job type
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "50")]
        per_page: u32,
    },
    /// Show job details
    Show {
        /// Job ID
        id: String,
    },
    /// Put a failed job back in the queue
    Retry {
        /// Job ID
        id: String,
        /// Start the attempt count from zero
        #[arg(long)]
        reset_attempts: bool,
    },
    /// Withdraw a pending job
    Cancel {
        /// Job ID
        id: String,
    },
    /// Job counts per status
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Jobs { command } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            match command {
                JobCommands::List {
                    status,
                    job_type,
                    page,
                    per_page,
                } => {
                    commands::jobs::list(&client, status, job_type, page, per_page).await?;
                }
                JobCommands::Show { id } => {
                    commands::jobs::show(&client, &id).await?;
                }
                JobCommands::Retry { id, reset_attempts } => {
                    commands::jobs::retry(&client, &id, reset_attempts).await?;
                }
                JobCommands::Cancel { id } => {
                    commands::jobs::cancel(&client, &id).await?;
                }
                JobCommands::Stats => {
                    commands::jobs::stats(&client).await?;
                }
            }
        }
        Commands::Enqueue {
            job_type,
            payload,
            at,
        } => {
            let client = commands::ApiClient::new(&cli.api_url)?;
            commands::jobs::enqueue(&client, &job_type, &payload, at).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
