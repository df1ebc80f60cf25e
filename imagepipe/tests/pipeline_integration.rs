//! End-to-end tests of the image pipeline through its public API.
//!
//! These tests verify:
//! - Identical concurrent requests share one network fetch
//! - The shared fetch survives partial cancellation and stops on full cancellation
//! - Memory eviction under a byte cap
//! - Disk read-after-write and disk hits after memory is cleared
//! - Paused requests start in submission order

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;

use imagepipe::config::ImagePipelineConfig;
use imagepipe::disk::FixedFreeSpace;
use imagepipe::executor::InlineExecutorSupplier;
use imagepipe::image::{DecodedImage, HeapPixelBuffer, QualityInfo};
use imagepipe::key::{encoded_key_for_uri, CacheKey};
use imagepipe::memory::{CountingMemoryCache, MemoryCacheParams};
use imagepipe::pipeline::{ImagePipeline, Outcome, SequenceOptions};
use imagepipe::producer::FetchError;
use imagepipe::producers::{FetchResponse, NetworkFetcher};
use imagepipe::request::{CallerContext, ImageRequest, ImageUri};
use imagepipe::resource::ResourceHandle;

// =============================================================================
// Test Helpers
// =============================================================================

/// Sets its flag if dropped before being disarmed.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Serves a fixed PNG once its gate opens, recording every fetched URI.
struct GatedFetcher {
    body: Bytes,
    gate: watch::Receiver<bool>,
    calls: AtomicUsize,
    fetched: Mutex<Vec<String>>,
    abandoned: Arc<AtomicBool>,
}

impl GatedFetcher {
    fn new(gate: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            body: Bytes::from(png(16, 12)),
            gate,
            calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
            abandoned: Arc::new(AtomicBool::new(false)),
        })
    }

    fn open() -> Arc<Self> {
        let (_tx, rx) = watch::channel(true);
        Self::new(rx)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NetworkFetcher for GatedFetcher {
    fn fetch(&self, uri: &ImageUri) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().push(uri.as_str().to_string());
        let mut gate = self.gate.clone();
        let body = self.body.clone();
        let flag = DropFlag(Arc::clone(&self.abandoned));
        async move {
            // A closed sender with the gate already open is fine.
            let _ = gate.wait_for(|open| *open).await;
            std::mem::forget(flag);
            Ok(FetchResponse::from_bytes(body))
        }
        .boxed()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let canvas = ::image::RgbaImage::new(width, height);
    let mut out = std::io::Cursor::new(Vec::new());
    canvas
        .write_to(&mut out, ::image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

fn pipeline_with(
    dir: &TempDir,
    fetcher: Arc<GatedFetcher>,
    options: SequenceOptions,
) -> ImagePipeline {
    let config = ImagePipelineConfig::with_disk_directory(dir.path())
        .with_executor_supplier(Arc::new(InlineExecutorSupplier))
        .with_network_fetcher(fetcher)
        .with_free_space_provider(Arc::new(FixedFreeSpace::new(u64::MAX)))
        .with_sequence_options(options);
    ImagePipeline::new(config).unwrap()
}

fn pipeline(dir: &TempDir, fetcher: Arc<GatedFetcher>) -> ImagePipeline {
    pipeline_with(dir, fetcher, SequenceOptions::default())
}

fn request(uri: &str) -> ImageRequest {
    ImageRequest::from_uri(uri).unwrap()
}

/// Lets spawned fetch tasks run until `condition` holds.
async fn settle(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// Request multiplexing
// =============================================================================

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_fetch() {
    let dir = TempDir::new().unwrap();
    let (open, gate) = watch::channel(false);
    let fetcher = GatedFetcher::new(gate);
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));

    let sources: Vec<_> = (0..3)
        .map(|_| {
            pipeline.fetch_decoded_image(
                request("https://example.com/shared.png"),
                CallerContext::default(),
            )
        })
        .collect();
    settle(|| fetcher.calls() == 1).await;

    open.send(true).unwrap();
    for source in sources {
        let image = source.result().await.into_result().unwrap().unwrap();
        assert_eq!(image.get().unwrap().width(), 16);
    }
    assert_eq!(fetcher.calls(), 1);
    assert!(pipeline.multiplex_stats().coalesced_requests >= 2);
}

#[tokio::test]
async fn test_partial_cancellation_keeps_shared_fetch() {
    let dir = TempDir::new().unwrap();
    let (open, gate) = watch::channel(false);
    let fetcher = GatedFetcher::new(gate);
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));

    let mut sources: Vec<_> = (0..3)
        .map(|_| {
            pipeline.fetch_decoded_image(
                request("https://example.com/partial.png"),
                CallerContext::default(),
            )
        })
        .collect();
    settle(|| fetcher.calls() == 1).await;

    let survivor = sources.pop().unwrap();
    for source in sources {
        source.close();
        assert!(matches!(source.result().await, Outcome::Cancelled));
    }

    open.send(true).unwrap();
    assert!(matches!(survivor.result().await, Outcome::Success(Some(_))));
    assert!(!fetcher.abandoned.load(Ordering::SeqCst));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_cancelling_every_request_cancels_fetch() {
    let dir = TempDir::new().unwrap();
    let (_open, gate) = watch::channel(false);
    let fetcher = GatedFetcher::new(gate);
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));

    let sources: Vec<_> = (0..3)
        .map(|_| {
            pipeline.fetch_decoded_image(
                request("https://example.com/abandoned.png"),
                CallerContext::default(),
            )
        })
        .collect();
    settle(|| fetcher.calls() == 1).await;

    drop(sources);
    settle(|| fetcher.abandoned.load(Ordering::SeqCst)).await;
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_cancelled_fetch_kept_at_low_priority_is_reused() {
    let dir = TempDir::new().unwrap();
    let (open, gate) = watch::channel(false);
    let fetcher = GatedFetcher::new(gate);
    let options = SequenceOptions {
        keep_cancelled_fetch_as_low_priority: true,
        ..SequenceOptions::default()
    };
    let pipeline = pipeline_with(&dir, Arc::clone(&fetcher), options);
    let uri = "https://example.com/kept.png";

    let first = pipeline.fetch_decoded_image(request(uri), CallerContext::default());
    settle(|| fetcher.calls() == 1).await;
    drop(first);

    let second = pipeline.fetch_decoded_image(request(uri), CallerContext::default());
    open.send(true).unwrap();
    assert!(second.result().await.is_success());
    assert!(!fetcher.abandoned.load(Ordering::SeqCst));
    assert_eq!(fetcher.calls(), 1);
}

// =============================================================================
// Cache tiers
// =============================================================================

#[test]
fn test_memory_cache_evicts_unreferenced_entry_over_cap() {
    let cache = CountingMemoryCache::new(
        "decoded",
        MemoryCacheParams::new(150 * 1024, 16),
        |image: &DecodedImage| image.size_in_bytes(),
    );
    let image = |bytes: usize| {
        ResourceHandle::unmanaged(DecodedImage::new(
            1,
            1,
            QualityInfo::FULL,
            0,
            Box::new(HeapPixelBuffer::new(vec![0; bytes])),
        ))
    };
    let k1 = encoded_key_for_uri(&ImageUri::parse("https://example.com/k1.png").unwrap());
    let k2 = encoded_key_for_uri(&ImageUri::parse("https://example.com/k2.png").unwrap());

    let handle: Option<ResourceHandle<DecodedImage>> = cache.put(k1.clone(), &image(100 * 1024));
    drop(handle);
    let _k2_handle = cache.put(k2.clone(), &image(100 * 1024));

    assert!(cache.get(&k1).is_none());
    assert!(cache.get(&k2).is_some());
    assert!(cache.size_in_bytes() <= 150 * 1024);
}

#[tokio::test]
async fn test_disk_serves_image_after_memory_cleared() {
    let dir = TempDir::new().unwrap();
    let fetcher = GatedFetcher::open();
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));
    let request = request("https://example.com/persisted.png");

    let first = pipeline
        .fetch_decoded_image(request.clone(), CallerContext::default())
        .result()
        .await;
    assert!(first.is_success());
    drop(first);
    assert!(pipeline.is_in_disk_cache_sync(&request));

    pipeline.clear_memory_caches();
    assert!(!pipeline.is_in_bitmap_memory_cache(&request));

    let second = pipeline
        .fetch_decoded_image(request.clone(), CallerContext::default())
        .result()
        .await;
    assert!(second.is_success());
    assert_eq!(fetcher.calls(), 1);

    let stats = pipeline.stats().stats;
    assert!(stats.disk.hits + stats.staging.hits >= 1);
}

#[tokio::test]
async fn test_encoded_fetch_returns_original_bytes() {
    let dir = TempDir::new().unwrap();
    let fetcher = GatedFetcher::open();
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));

    let bytes = pipeline
        .fetch_encoded_image(
            request("https://example.com/raw.png"),
            CallerContext::default(),
        )
        .result()
        .await
        .into_result()
        .unwrap()
        .unwrap();
    assert_eq!(bytes.get().unwrap().bytes(), &fetcher.body);
}

#[tokio::test]
async fn test_caller_salt_partitions_encoded_entries() {
    let dir = TempDir::new().unwrap();
    let fetcher = GatedFetcher::open();
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));
    let uri = "https://example.com/salted.png";

    for salt in ["alpha", "beta"] {
        let outcome = pipeline
            .prefetch_to_disk_cache(request(uri), CallerContext::default().with_cache_salt(salt))
            .result()
            .await;
        assert!(outcome.is_success());
    }
    assert_eq!(fetcher.calls(), 2);

    let unsalted: CacheKey = encoded_key_for_uri(&ImageUri::parse(uri).unwrap());
    assert!(!pipeline
        .disk_caches()
        .default_cache()
        .disk_check_sync(&unsalted));
}

// =============================================================================
// Pause and resume
// =============================================================================

#[tokio::test]
async fn test_paused_requests_start_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let fetcher = GatedFetcher::open();
    let pipeline = pipeline(&dir, Arc::clone(&fetcher));
    let uris = [
        "https://example.com/1.png",
        "https://example.com/2.png",
        "https://example.com/3.png",
    ];

    pipeline.pause();
    let sources: Vec<_> = uris
        .iter()
        .map(|uri| pipeline.fetch_decoded_image(request(uri), CallerContext::default()))
        .collect();
    tokio::task::yield_now().await;
    assert_eq!(fetcher.calls(), 0);

    pipeline.resume();
    for source in sources {
        assert!(source.result().await.is_success());
    }
    assert_eq!(*fetcher.fetched.lock(), uris.map(String::from).to_vec());
}
