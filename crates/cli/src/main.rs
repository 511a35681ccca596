mod config_commands;
mod db_commands;
mod host_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    codehost_config::CodehostConfig,
    tracing::debug,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{config_commands::ConfigAction, db_commands::DbAction, host_commands::HostAction};

#[derive(Parser)]
#[command(name = "codehost", about = "Per-user code hosts on Docker Swarm")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of the discovered one.
    #[arg(long, global = true, env = "CODEHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (overrides the config value).
    #[arg(long, global = true, env = "CODEHOST_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Code host management.
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config plus the database it points at, resolved once from global flags.
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub config: CodehostConfig,
    pub database_url: String,
}

impl Settings {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = match cli.config {
            Some(ref path) => codehost_config::load_from(path)?,
            None => codehost_config::discover_and_load(),
        };
        if let Some(ref url) = cli.database_url {
            config.database.url = Some(url.clone());
        }
        let database_url = codehost_config::database_url(&config);
        let config_path = cli
            .config
            .clone()
            .or_else(codehost_config::find_config_file);
        debug!(config = ?config_path, database_url = %database_url, "settings resolved");
        Ok(Self {
            config_path,
            config,
            database_url,
        })
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_telemetry(&cli);
    debug!(version = env!("CARGO_PKG_VERSION"), "codehost starting");
    let settings = Settings::resolve(&cli)?;

    match cli.command {
        Commands::Host { action } => host_commands::handle_host(action, &settings).await,
        Commands::Db { action } => db_commands::handle_db(action, &settings).await,
        Commands::Config { action } => config_commands::handle_config(action, &settings),
    }
}
