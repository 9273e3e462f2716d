use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use reqbin::{
    config::Config,
    logging,
    purge::{self, PurgeSchedule},
    server,
    store::{PurgeSummary, Store},
};

#[derive(Debug, Parser)]
#[command(name = "reqbin")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the request logger.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Delete expired sessions and their requests once, then exit.
    Purge {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `purge.max_age_secs`.
        #[arg(long)]
        max_age_secs: Option<u64>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let store = Store::open(&config.storage.path)?;
            let server = server::serve(&config, store.clone()).await?;
            let purger = purge::spawn(store, PurgeSchedule::from(&config.purge));
            eprintln!("{}", startup_summary(&config, server.listen_addr));
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
            purger.shutdown().await;
        }
        Command::Purge {
            config,
            max_age_secs,
            log_level,
        } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.purge.max_age());
            let store = Store::open(&config.storage.path)?;
            let summary = store.purge_sessions(max_age).await?;
            tracing::info!(
                sessions = summary.sessions,
                requests = summary.requests,
                max_age_secs = max_age.as_secs(),
                "purge finished"
            );
            println!("{}", purge_summary_line(summary, max_age));
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let config_source = config
        .source()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_owned());

    format!(
        "startup config: listen={}, storage_path={}, purge_interval_secs={}, max_age_secs={}, max_body_bytes={}, config_source={}",
        listen_addr,
        config.storage.path.display(),
        config.purge.interval_secs,
        config.purge.max_age_secs,
        config.server.max_body_bytes,
        config_source
    )
}

fn purge_summary_line(summary: PurgeSummary, max_age: Duration) -> String {
    format!(
        "purged {} session(s) and {} request(s) older than {}s",
        summary.sessions,
        summary.requests,
        max_age.as_secs()
    )
}
