//! Cache management CLI commands.

use std::time::Duration;

use clap::Subcommand;
use imagepipe::config::{days_to_duration, format_size};

use super::common::parse_source;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show disk cache statistics
    Stats,
    /// Clear both disk caches, removing every stored image
    Clear,
    /// Remove expired entries and shrink caches over their size limit
    Prune,
    /// Remove entries not used within the given number of days
    Trim {
        /// Maximum entry age in days
        #[arg(long)]
        max_age_days: u64,
    },
    /// Remove one image from every cache tier
    Evict {
        /// Image URI or absolute path
        source: String,
    },
}

/// Run a cache subcommand.
pub fn run(action: CacheAction) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("cache");
    let pipeline = runner.create_pipeline()?;
    let cache_dir = runner.config().cache.directory.clone();

    match action {
        CacheAction::Stats => {
            let stats = pipeline.stats();
            println!("Disk cache: {}", cache_dir.display());
            println!("  Entries: {}", stats.disk_entries);
            println!(
                "  Size:    {} of {}",
                format_size(stats.disk_bytes),
                format_size(stats.disk_limit_bytes)
            );
            for cache in pipeline.disk_caches().distinct() {
                let storage = cache.storage();
                println!(
                    "  {}: {} entries, {} ({:?} space)",
                    storage.root().display(),
                    storage.count(),
                    format_size(storage.size()),
                    storage.space_tier()
                );
            }
        }
        CacheAction::Clear => {
            println!("Clearing disk caches at: {}", cache_dir.display());
            let before = pipeline.stats();
            runner.block_on(pipeline.clear_disk_caches());
            println!(
                "Deleted {} entries, freed {}",
                before.disk_entries,
                format_size(before.disk_bytes)
            );
        }
        CacheAction::Prune => {
            let removed = pipeline.prune_disk_caches();
            println!("Pruned {} entries", removed);
        }
        CacheAction::Trim { max_age_days } => {
            let max_age: Duration = days_to_duration(max_age_days);
            let before = pipeline.stats().disk_entries;
            pipeline.clear_old_disk_entries(max_age);
            let after = pipeline.stats().disk_entries;
            println!(
                "Removed {} entries older than {} day(s)",
                before.saturating_sub(after),
                max_age_days
            );
        }
        CacheAction::Evict { source } => {
            let uri = parse_source(&source)?;
            runner.block_on(pipeline.evict_from_cache(&uri));
            println!("Evicted {}", uri);
        }
    }

    Ok(())
}
