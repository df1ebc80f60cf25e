//! HTTP(S) fetching.
//!
//! The fetcher abstraction returns the response body as a stream so the
//! producer can report progress and propagate partial data for progressive
//! decoding while the download is still running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, trace};

use crate::executor::Executor;
use crate::image::EncodedImage;
use crate::producer::{Consumer, FetchError, PipelineError, Producer, ProducerContext, Status};
use crate::request::ImageUri;

const PRODUCER_NAME: &str = "NetworkFetchProducer";

/// Minimum time between two intermediate results of one download.
pub const DEFAULT_INTERMEDIATE_INTERVAL: Duration = Duration::from_millis(100);

/// Scale for the progress estimate when the response has no length.
const UNKNOWN_LENGTH_PROGRESS_SCALE: f64 = 50_000.0;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("imagepipe/", env!("CARGO_PKG_VERSION"));

/// A response whose body has not been read yet.
pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl FetchResponse {
    /// A response whose whole body is already in memory.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            content_length: Some(bytes.len() as u64),
            body: stream::iter([Ok(bytes)]).boxed(),
        }
    }
}

/// Starts network requests for image URIs.
pub trait NetworkFetcher: Send + Sync {
    fn fetch(&self, uri: &ImageUri) -> BoxFuture<'static, Result<FetchResponse, FetchError>>;
}

/// [`NetworkFetcher`] backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetworkFetcher {
    client: reqwest::Client,
}

impl HttpNetworkFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network {
                uri: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

impl NetworkFetcher for HttpNetworkFetcher {
    fn fetch(&self, uri: &ImageUri) -> BoxFuture<'static, Result<FetchResponse, FetchError>> {
        let client = self.client.clone();
        let uri = uri.as_str().to_string();
        async move {
            let response = client
                .get(uri.as_str())
                .send()
                .await
                .map_err(|e| FetchError::Network {
                    uri: uri.clone(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                    uri,
                });
            }

            let content_length = response.content_length();
            let body = response
                .bytes_stream()
                .map(move |chunk| {
                    chunk.map_err(|e| FetchError::Network {
                        uri: uri.clone(),
                        reason: e.to_string(),
                    })
                })
                .boxed();
            Ok(FetchResponse {
                content_length,
                body,
            })
        }
        .boxed()
    }
}

/// Estimated download progress in `[0, 1)` while bytes are still arriving.
fn download_progress(downloaded: usize, total: Option<u64>) -> f32 {
    match total {
        Some(total) if total > 0 => (downloaded as f64 / total as f64).min(1.0) as f32,
        _ => (1.0 - (-(downloaded as f64) / UNKNOWN_LENGTH_PROGRESS_SCALE).exp()) as f32,
    }
}

/// Leaf stage downloading encoded bytes.
///
/// Downloads run as futures on the network executor and stop as soon as
/// the request is cancelled.
pub struct NetworkFetchProducer {
    fetcher: Arc<dyn NetworkFetcher>,
    executor: Arc<dyn Executor>,
    intermediate_interval: Duration,
}

impl NetworkFetchProducer {
    pub fn new(fetcher: Arc<dyn NetworkFetcher>, executor: Arc<dyn Executor>) -> Self {
        Self {
            fetcher,
            executor,
            intermediate_interval: DEFAULT_INTERMEDIATE_INTERVAL,
        }
    }

    pub fn with_intermediate_interval(mut self, interval: Duration) -> Self {
        self.intermediate_interval = interval;
        self
    }
}

enum FetchOutcome {
    Done(Bytes),
    Failed(FetchError),
    Cancelled,
}

async fn download(
    fetcher: Arc<dyn NetworkFetcher>,
    uri: ImageUri,
    consumer: Arc<dyn Consumer<EncodedImage>>,
    context: ProducerContext,
    intermediate_interval: Duration,
) -> Result<Bytes, FetchError> {
    let FetchResponse {
        content_length,
        mut body,
    } = fetcher.fetch(&uri).await?;

    let mut buffer = BytesMut::new();
    let mut last_intermediate = Instant::now();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);
        consumer.on_progress_update(download_progress(buffer.len(), content_length));

        if context.is_intermediate_results_expected()
            && last_intermediate.elapsed() >= intermediate_interval
        {
            last_intermediate = Instant::now();
            let partial = EncodedImage::from_bytes(Bytes::copy_from_slice(&buffer));
            consumer.on_intermediate_result(partial, Status::NONE);
        }
    }
    Ok(buffer.freeze())
}

impl Producer<EncodedImage> for NetworkFetchProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        let listener = Arc::clone(context.listener());
        listener.on_producer_start(context.id(), PRODUCER_NAME);

        let fetcher = Arc::clone(&self.fetcher);
        let uri = context.request().uri().clone();
        let token = context.cancellation_token();
        let interval = self.intermediate_interval;
        let started = Instant::now();

        let task = async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => FetchOutcome::Cancelled,
                result = download(fetcher, uri.clone(), Arc::clone(&consumer), context.clone(), interval) => {
                    match result {
                        Ok(bytes) => FetchOutcome::Done(bytes),
                        Err(e) => FetchOutcome::Failed(e),
                    }
                }
            };

            let request_id = context.id();
            match outcome {
                FetchOutcome::Done(bytes) => {
                    let extras = [
                        ("total_bytes", bytes.len().to_string()),
                        ("fetch_ms", started.elapsed().as_millis().to_string()),
                    ];
                    trace!(request_id, uri = %uri.as_str(), size = bytes.len(), "Download complete");
                    listener.on_producer_finish_with_success(request_id, PRODUCER_NAME, &extras);
                    listener.on_ultimate_producer_reached(request_id, PRODUCER_NAME, true);
                    consumer.on_final_result(Some(EncodedImage::from_bytes(bytes)), Status::NONE);
                }
                FetchOutcome::Failed(e) => {
                    debug!(request_id, error = %e, "Download failed");
                    let error = PipelineError::Fetch(e);
                    listener.on_producer_finish_with_failure(request_id, PRODUCER_NAME, &error, &[]);
                    listener.on_ultimate_producer_reached(request_id, PRODUCER_NAME, false);
                    consumer.on_failure(error);
                }
                FetchOutcome::Cancelled => {
                    trace!(request_id, "Download cancelled");
                    listener.on_producer_finish_with_cancellation(request_id, PRODUCER_NAME);
                    consumer.on_cancellation();
                }
            }
        };
        self.executor.spawn(task.boxed());
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}
