use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbpool::cli::{commands, parse_params};
use dbpool::config::load_config;
use dbpool::Core;

#[derive(Parser)]
#[command(name = "dbpool")]
#[command(version, about = "Resilient database connection pool with circuit breaking", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); falls back to DB_* environment variables
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, run a trivial query and print pool health
    Check,

    /// Run a query and print the rows as JSON
    Query {
        /// SQL statement with `?` or `$n` placeholders
        sql: String,

        /// Positional parameter (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Run a statement and print the affected row count
    Exec {
        /// SQL statement with `?` or `$n` placeholders
        sql: String,

        /// Positional parameter (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Print pool statistics as JSON
    Stats {
        /// List individual connections instead
        #[arg(long)]
        connections: bool,
    },

    /// Stop admitting work and close all connections
    Drain {
        /// How long to wait for in-use connections
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // One-shot commands: current_thread keeps startup cheap
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let core = Core::new(config).await?;

    match cli.command {
        Commands::Check => commands::cmd_check(&core).await,
        Commands::Query { sql, params } => commands::cmd_query(&core, &sql, &parse_params(&params)).await,
        Commands::Exec { sql, params } => commands::cmd_exec(&core, &sql, &parse_params(&params)).await,
        Commands::Stats { connections } => commands::cmd_stats(&core, connections).await,
        Commands::Drain { timeout_ms } => commands::cmd_drain(&core, timeout_ms).await,
    }
}
