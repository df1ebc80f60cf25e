//! Configuration management CLI commands.
//!
//! These commands never start logging or the pipeline, so they work even
//! when the log directory or the cache directory is unusable.

use clap::Subcommand;
use imagepipe::config::{config_file_path, ConfigFile};

use crate::error::CliError;

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Show the configuration file path
    Path,

    /// Print the effective configuration (file values over defaults)
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },
}

/// Run a config subcommand.
pub fn run(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Path => run_path(),
        ConfigCommands::Show => run_show(),
        ConfigCommands::Init { force } => run_init(force),
    }
}

fn run_path() -> Result<(), CliError> {
    println!("{}", config_file_path().display());
    Ok(())
}

fn run_show() -> Result<(), CliError> {
    let path = config_file_path();
    let config = ConfigFile::load()?;

    if path.exists() {
        println!("; Loaded from {}", path.display());
    } else {
        println!("; No config file at {}; showing defaults", path.display());
    }
    println!("{}", config.to_ini_string());
    Ok(())
}

fn run_init(force: bool) -> Result<(), CliError> {
    let path = config_file_path();

    if path.exists() && !force {
        println!("Configuration already exists at {}", path.display());
        println!("Use --force to replace it with defaults.");
        return Ok(());
    }

    if force {
        ConfigFile::default().save_to(&path)?;
    } else {
        ConfigFile::ensure_exists()?;
    }
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
