//! Prefetch command - warm the caches for several images at once.

use clap::ValueEnum;
use futures::future::join_all;
use imagepipe::{CallerContext, Outcome};
use tracing::warn;

use super::common::{build_request, CacheTarget};
use crate::error::CliError;
use crate::runner::CliRunner;

/// How far a prefetch goes.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum PrefetchTarget {
    /// Store encoded bytes on disk only
    #[default]
    Disk,
    /// Decode into the memory cache as well
    Memory,
}

/// Arguments for the prefetch command.
pub struct PrefetchArgs {
    pub sources: Vec<String>,
    pub target: PrefetchTarget,
    pub cache: CacheTarget,
}

/// Run the prefetch command.
pub fn run(args: PrefetchArgs) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("prefetch");
    let pipeline = runner.create_pipeline()?;

    let requests = args
        .sources
        .iter()
        .map(|source| build_request(source, None, args.cache))
        .collect::<Result<Vec<_>, _>>()?;

    println!("Prefetching {} image(s) to {:?}...", requests.len(), args.target);

    let sources: Vec<_> = requests
        .into_iter()
        .map(|request| match args.target {
            PrefetchTarget::Disk => {
                pipeline.prefetch_to_disk_cache(request, CallerContext::default())
            }
            PrefetchTarget::Memory => {
                pipeline.prefetch_to_bitmap_cache(request, CallerContext::default())
            }
        })
        .collect();
    let outcomes = runner.block_on(join_all(sources.into_iter().map(|s| s.result())));

    let mut failed = 0usize;
    for (source, outcome) in args.sources.iter().zip(outcomes) {
        match outcome {
            Outcome::Success(_) => println!("  ok      {}", source),
            Outcome::Failure(e) => {
                failed += 1;
                warn!(source = %source, error = %e, "Prefetch failed");
                println!("  failed  {} ({})", source, e);
            }
            Outcome::Cancelled => {
                failed += 1;
                println!("  cancel  {}", source);
            }
        }
    }

    let stats = pipeline.multiplex_stats();
    println!();
    println!(
        "Done: {} ok, {} failed ({} duplicate requests coalesced)",
        args.sources.len() - failed,
        failed,
        stats.coalesced_requests
    );

    if failed > 0 {
        return Err(CliError::PartialFailure {
            failed,
            total: args.sources.len(),
        });
    }
    Ok(())
}
