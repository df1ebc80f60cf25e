//! imagepipe CLI - Command-line interface
//!
//! Loads images through the imagepipe pipeline and manages its caches.

mod commands;
mod error;
mod runner;

use clap::{Parser, Subcommand};

use commands::cache::CacheAction;
use commands::common::{parse_dimensions, CacheTarget};
use commands::config::ConfigCommands;
use commands::prefetch::PrefetchTarget;

#[derive(Parser)]
#[command(name = "imagepipe")]
#[command(version = imagepipe::VERSION)]
#[command(about = "Load images through a multiplexed, three-tier cached pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and decode one image, filling every cache tier on the way
    Fetch {
        /// Image URI (http, https, file, data) or absolute path
        source: String,

        /// Downsample to fit WIDTHxHEIGHT while decoding
        #[arg(long, value_parser = parse_dimensions)]
        resize: Option<(u32, u32)>,

        /// Disk cache to use
        #[arg(long, value_enum, default_value = "main")]
        cache: CacheTarget,

        /// Also write the original encoded bytes to this file
        #[arg(long, short)]
        output: Option<String>,

        /// Print cache statistics afterwards
        #[arg(long)]
        stats: bool,
    },

    /// Warm the caches for one or more images without returning them
    Prefetch {
        /// Image URIs or absolute paths
        #[arg(required = true)]
        sources: Vec<String>,

        /// How far to take each image
        #[arg(long, value_enum, default_value = "disk")]
        to: PrefetchTarget,

        /// Disk cache to use
        #[arg(long, value_enum, default_value = "main")]
        cache: CacheTarget,
    },

    /// Inspect and maintain the disk caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Inspect and initialize the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Fetch {
            source,
            resize,
            cache,
            output,
            stats,
        } => commands::fetch::run(commands::fetch::FetchArgs {
            source,
            resize,
            cache,
            output,
            show_stats: stats,
        }),
        Commands::Prefetch { sources, to, cache } => {
            commands::prefetch::run(commands::prefetch::PrefetchArgs {
                sources,
                target: to,
                cache,
            })
        }
        Commands::Cache { action } => commands::cache::run(action),
        Commands::Config { command } => commands::config::run(command),
    };

    if let Err(e) = result {
        e.exit();
    }
}
