//! Fetch command - load one image through the pipeline.

use std::time::Instant;

use imagepipe::{CallerContext, DataEvent, OutcomeError};
use tracing::info;

use super::common::{build_request, CacheTarget};
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the fetch command.
pub struct FetchArgs {
    pub source: String,
    pub resize: Option<(u32, u32)>,
    pub cache: CacheTarget,
    pub output: Option<String>,
    pub show_stats: bool,
}

/// Run the fetch command.
pub fn run(args: FetchArgs) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("fetch");
    let pipeline = runner.create_pipeline()?;
    let request = build_request(&args.source, args.resize, args.cache)?;

    println!("Fetching {}", request.uri());
    let start = Instant::now();

    let mut source = pipeline.fetch_decoded_image(request.clone(), CallerContext::default());
    let image = runner.block_on(async {
        let mut intermediates = 0usize;
        while let Some(event) = source.next_event().await {
            match event {
                DataEvent::Intermediate(_) => intermediates += 1,
                DataEvent::Progress(_) => {}
                DataEvent::Final(image) => {
                    if intermediates > 0 {
                        println!("  Progressive previews: {}", intermediates);
                    }
                    return Ok(image);
                }
                DataEvent::Failure(e) => return Err(CliError::Request(e)),
                DataEvent::Cancelled => return Err(CliError::Cancelled),
            }
        }
        Err(CliError::Cancelled)
    })?;

    let elapsed = start.elapsed();
    match image.as_ref().and_then(|handle| handle.get().ok()) {
        Some(decoded) => {
            println!(
                "Decoded {}x{} (rotation {}°) in {:.2}s",
                decoded.width(),
                decoded.height(),
                decoded.rotation_angle(),
                elapsed.as_secs_f64()
            );
            info!(
                width = decoded.width(),
                height = decoded.height(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Fetch complete"
            );
        }
        None => println!("No image produced ({:.2}s)", elapsed.as_secs_f64()),
    }
    drop(image);

    if let Some(path) = args.output {
        let bytes = runner
            .block_on(
                pipeline
                    .fetch_encoded_image(request, CallerContext::default())
                    .result(),
            )
            .into_result()
            .map_err(|e| match e {
                OutcomeError::Failed(e) => CliError::Request(e),
                OutcomeError::Cancelled => CliError::Cancelled,
            })?;
        if let Some(bytes) = bytes.as_ref().and_then(|handle| handle.get().ok()) {
            std::fs::write(&path, bytes.bytes()).map_err(|error| CliError::FileWrite {
                path: path.clone(),
                error,
            })?;
            println!("Saved encoded bytes to {} ({} bytes)", path, bytes.size_in_bytes());
        }
    }

    if args.show_stats {
        println!();
        println!("{}", pipeline.stats().format());
    }

    Ok(())
}
