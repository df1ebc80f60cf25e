//! `data:` URIs carrying the image inline.

use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use tracing::debug;

use crate::executor::Executor;
use crate::image::EncodedImage;
use crate::producer::{Consumer, FetchError, PipelineError, Producer, ProducerContext, Status};

const PRODUCER_NAME: &str = "DataFetchProducer";
const DATA_URI_PREFIX: &str = "data:";

/// Decodes the payload of a `data:` URI.
///
/// Base64 payloads may contain ASCII whitespace; other payloads are
/// percent-decoded without treating `+` specially.
pub fn decode_data_uri(uri: &str) -> Result<Bytes, FetchError> {
    let rest = uri
        .strip_prefix(DATA_URI_PREFIX)
        .ok_or_else(|| FetchError::InvalidDataUri("missing data: prefix".to_string()))?;
    let (metadata, data) = rest
        .split_once(',')
        .ok_or_else(|| FetchError::InvalidDataUri("missing comma".to_string()))?;

    let is_base64 = metadata
        .split(';')
        .skip(1)
        .any(|param| param.trim().eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        decode_base64(data)?
    } else {
        percent_decode(data)?
    };
    Ok(Bytes::from(bytes))
}

fn decode_base64(data: &str) -> Result<Vec<u8>, FetchError> {
    let cleaned: Vec<u8> = data
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .map_err(|e| FetchError::InvalidDataUri(format!("invalid base64: {e}")))
}

fn percent_decode(input: &str) -> Result<Vec<u8>, FetchError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 2 >= bytes.len() {
            return Err(FetchError::InvalidDataUri(
                "incomplete percent-escape".to_string(),
            ));
        }
        let hi = (bytes[i + 1] as char).to_digit(16);
        let lo = (bytes[i + 2] as char).to_digit(16);
        match (hi, lo) {
            (Some(hi), Some(lo)) => {
                out.push(((hi << 4) | lo) as u8);
                i += 3;
            }
            _ => {
                return Err(FetchError::InvalidDataUri(
                    "invalid percent-escape".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

/// Leaf stage decoding `data:` URIs.
pub struct DataFetchProducer {
    executor: Arc<dyn Executor>,
}

impl DataFetchProducer {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

impl Producer<EncodedImage> for DataFetchProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        context
            .listener()
            .on_producer_start(context.id(), PRODUCER_NAME);
        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            let request_id = context.id();
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(request_id, PRODUCER_NAME);
                consumer.on_cancellation();
                return;
            }

            match decode_data_uri(context.request().uri().as_str()) {
                Ok(bytes) => {
                    listener.on_producer_finish_with_success(
                        request_id,
                        PRODUCER_NAME,
                        &[("size", bytes.len().to_string())],
                    );
                    listener.on_ultimate_producer_reached(request_id, PRODUCER_NAME, true);
                    consumer.on_final_result(Some(EncodedImage::from_bytes(bytes)), Status::NONE);
                }
                Err(e) => {
                    debug!(request_id, error = %e, "Data URI decode failed");
                    let error = PipelineError::Fetch(e);
                    listener.on_producer_finish_with_failure(request_id, PRODUCER_NAME, &error, &[]);
                    listener.on_ultimate_producer_reached(request_id, PRODUCER_NAME, false);
                    consumer.on_failure(error);
                }
            }
        }));
    }

    fn name(&self) -> &'static str {
        PRODUCER_NAME
    }
}
