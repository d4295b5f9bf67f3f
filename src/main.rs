use clap::{Parser, Subcommand};
use spotkeeper::config::AppConfig;
use spotkeeper::error::{KeeperError, Result};
use std::path::PathBuf;
use tracing::error;

mod main_runtime;

#[derive(Parser, Debug)]
#[command(name = "spotkeeper", version, about = "Single-position spot trading agent core")]
struct Cli {
    /// Directory holding default.toml and <env>.toml
    #[arg(long, env = "SPOTKEEPER_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Trade against the in-memory paper exchange regardless of config
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile, then run the agent until SIGINT/SIGTERM (default)
    Run {
        /// Ignore stdin; only manage the existing position
        #[arg(long)]
        no_signals: bool,
    },
    /// Run reconciliation once, print the report and exit
    Reconcile,
    /// Print the persisted snapshot
    Status,
    /// Clear a sticky risk halt in the persisted snapshot
    ResetHalt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config_dir)?;
    if cli.dry_run {
        config.exchange.dry_run = true;
    }
    if let Err(problems) = config.validate() {
        for p in &problems {
            eprintln!("config: {}", p);
        }
        return Err(KeeperError::Validation(problems.join("; ")));
    }

    match cli.command.unwrap_or(Commands::Run { no_signals: false }) {
        Commands::Run { no_signals } => {
            main_runtime::init_logging(&config.logging);
            if let Err(e) = main_runtime::run_agent(config, !no_signals).await {
                error!("agent stopped with error: {}", e);
                return Err(e);
            }
            // A pending stdin read would keep the runtime's blocking pool alive
            std::process::exit(0);
        }
        Commands::Reconcile => {
            main_runtime::init_logging_simple();
            main_runtime::run_reconcile(config).await?;
        }
        Commands::Status => {
            main_runtime::init_logging_simple();
            main_runtime::show_status(&config).await?;
        }
        Commands::ResetHalt => {
            main_runtime::init_logging_simple();
            main_runtime::reset_halt(&config).await?;
        }
    }
    Ok(())
}
