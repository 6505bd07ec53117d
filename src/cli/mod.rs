use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::session::Engine;

pub mod commands;

use self::commands::{DraftArgs, EditArgs, PlanScopeArgs, ScopeArgs, TrashArgs, VersionsArgs};

#[derive(Parser, Debug)]
#[command(
    name = "plansync",
    version,
    about = "Autosave, drafts, version history and trash for quarterly plans"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the config file location (takes precedence over PLANSYNC_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over PLANSYNC_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Reconcile a plan, then apply JSON documents (one per line) with autosave
    Edit(EditArgs),
    /// Show what loading a plan would do right now
    Status(ScopeArgs),
    /// Print the active plan for a period
    Show(PlanScopeArgs),
    /// Inspect, snapshot and restore plan versions
    Versions(VersionsArgs),
    /// Manage deleted plans
    Trash(TrashArgs),
    /// Inspect or clear this device's local draft
    Draft(DraftArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let engine = Engine::open(&config, loader.paths())?;

    let output = match &cli.command {
        Commands::Edit(args) => match &args.file {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                commands::edit(&engine, args, BufReader::new(file))?
            }
            None => {
                if atty::is(atty::Stream::Stdin) {
                    bail!("pipe JSON documents on stdin or pass --file");
                }
                commands::edit(&engine, args, io::stdin().lock())?
            }
        },
        Commands::Status(args) => commands::status(&engine, args)?,
        Commands::Show(args) => commands::show(&engine, args)?,
        Commands::Versions(args) => commands::versions(&engine, args)?,
        Commands::Trash(args) => commands::trash(&engine, args)?,
        Commands::Draft(args) => commands::draft(&engine, args)?,
    };
    print!("{output}");
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
