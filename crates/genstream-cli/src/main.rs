use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use logging::LogFormat;

#[derive(Parser)]
#[command(name = "genstream")]
#[command(about = "genstream - streamed, cancellable step-wise image generation", long_about = None)]
struct Cli {
    /// Log output format (filter with RUST_LOG)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Config file (defaults to $GENSTREAM_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the programs in the effective catalog
    Programs,
    /// Run one headless session and print its progress
    Run(commands::run::RunArgs),
    /// Read text commands from stdin as a single client connection
    Repl(commands::repl::ReplArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the config file location
    Path,
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config = commands::utils::config_service(cli.config);
    match cli.command {
        Commands::Programs => commands::programs::list(&config)?,
        Commands::Run(args) => commands::run::run(&config, args).await?,
        Commands::Repl(args) => commands::repl::run(&config, args).await?,
        Commands::Config { action } => match action {
            ConfigAction::Path => commands::config::path(&config)?,
            ConfigAction::Show => commands::config::show(&config)?,
        },
    }

    Ok(())
}
