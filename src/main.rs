//! Holdfast CLI - administration of an embedded Holdfast database directory

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use holdfast::config::{self, HoldfastConfig};

mod commands;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(version)]
#[command(about = "Embedded object-relational persistence - database administration")]
#[command(long_about = r#"
Inspect and maintain a Holdfast database directory (holdfast.db, lobs/,
compaction marker).

Example usage:
  holdfast init
  holdfast --root ./data stats
  holdfast --root ./data compact --force
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit machine-readable JSON instead of styled output
    #[arg(long, global = true)]
    json: bool,

    /// Database directory
    #[arg(short, long, global = true, default_value = ".")]
    root: PathBuf,

    /// Configuration file (defaults to holdfast.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show tables, row counts and large-object totals
    Stats,

    /// Rewrite the database file if compaction is due
    Compact {
        /// Compact even if the interval has not elapsed
        #[arg(short, long)]
        force: bool,
    },

    /// Replay the pending-deletion journal and report what was done
    Recover,

    /// Drop every table and large object
    Erase {
        /// Confirm the erase
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl OutputMode {
    pub fn is_human(self) -> bool {
        self == OutputMode::Human
    }
}

/// Print a success envelope in JSON mode.
pub fn emit_success(mode: OutputMode, command: &str, data: serde_json::Value) -> anyhow::Result<()> {
    if mode == OutputMode::Json {
        let envelope = serde_json::json!({
            "ok": true,
            "command": command,
            "data": data,
        });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    }
    Ok(())
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<HoldfastConfig> {
    Ok(config::load_config(path)?.unwrap_or_default())
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mode = if cli.json { OutputMode::Json } else { OutputMode::Human };
    if let Err(e) = run(cli, mode) {
        if mode.is_human() {
            holdfast::ui::error(&format!("{:#}", e));
        } else {
            let envelope = serde_json::json!({ "ok": false, "error": format!("{:#}", e) });
            println!("{}", envelope);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli, mode: OutputMode) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Init { force } => {
            let path = cli.config.clone().unwrap_or_else(config::default_config_path);
            commands::run_init(mode, &path, force)
        }
        Commands::Stats => commands::run_stats(mode, &cli.root, resolve_config(config_path)?),
        Commands::Compact { force } => {
            commands::run_compact(mode, &cli.root, resolve_config(config_path)?, force)
        }
        Commands::Recover => commands::run_recover(mode, &cli.root, resolve_config(config_path)?),
        Commands::Erase { yes } => {
            if !yes {
                anyhow::bail!("refusing to erase {} without --yes", cli.root.display());
            }
            commands::run_erase(mode, &cli.root, resolve_config(config_path)?)
        }
    }
}
