//! Local file, content, asset and resource sources.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::executor::Executor;
use crate::image::{find_exif_thumbnail, EncodedImage, ImageDecoder};
use crate::producer::{Consumer, FetchError, PipelineError, Producer, ProducerContext, Status};
use crate::request::{ImageUri, ResizeOptions, SourceType};

use super::thumbnail::{is_image_big_enough, ThumbnailProducer};

const PRODUCER_NAME: &str = "LocalFetchProducer";
const EXIF_PRODUCER_NAME: &str = "LocalExifThumbnailProducer";

/// Largest thumbnail EXIF data is expected to carry, per side.
const MAX_EXIF_THUMBNAIL_SIZE: u32 = 512;

/// Maps local URIs to files on disk.
pub trait LocalSourceResolver: Send + Sync {
    fn resolve(&self, uri: &ImageUri) -> Result<PathBuf, FetchError>;
}

/// Resolves `file://` URIs to their path and other local schemes against a
/// root directory per scheme.
#[derive(Debug, Clone, Default)]
pub struct DirectoryResolver {
    roots: HashMap<SourceType, PathBuf>,
}

impl DirectoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, source_type: SourceType, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(source_type, root.into());
        self
    }
}

impl LocalSourceResolver for DirectoryResolver {
    fn resolve(&self, uri: &ImageUri) -> Result<PathBuf, FetchError> {
        match uri.source_type() {
            SourceType::LocalFile => uri.to_file_path().ok_or_else(|| FetchError::Io {
                path: uri.as_str().to_string(),
                reason: "not a local path".to_string(),
            }),
            source_type @ (SourceType::LocalContent
            | SourceType::LocalAsset
            | SourceType::LocalResource) => {
                let root = self
                    .roots
                    .get(&source_type)
                    .ok_or_else(|| FetchError::UnsupportedSource(source_type.name().to_string()))?;
                let relative = uri.relative_path();
                let contained = !relative.is_empty()
                    && Path::new(&relative)
                        .components()
                        .all(|c| matches!(c, Component::Normal(_)));
                if !contained {
                    return Err(FetchError::NotFound(uri.as_str().to_string()));
                }
                Ok(root.join(relative))
            }
            other => Err(FetchError::UnsupportedSource(other.name().to_string())),
        }
    }
}

fn read_file(path: &Path) -> Result<Bytes, FetchError> {
    std::fs::read(path).map(Bytes::from).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FetchError::NotFound(path.display().to_string()),
        _ => FetchError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        },
    })
}

/// Reads whole local files on the storage-read executor.
pub struct LocalFetchProducer {
    resolver: Arc<dyn LocalSourceResolver>,
    executor: Arc<dyn Executor>,
}

impl LocalFetchProducer {
    pub fn new(resolver: Arc<dyn LocalSourceResolver>, executor: Arc<dyn Executor>) -> Self {
        Self { resolver, executor }
    }
}

impl Producer<EncodedImage> for LocalFetchProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        context
            .listener()
            .on_producer_start(context.id(), PRODUCER_NAME);
        let resolver = Arc::clone(&self.resolver);
        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            let request_id = context.id();
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(request_id, PRODUCER_NAME);
                consumer.on_cancellation();
                return;
            }

            let uri = context.request().uri();
            let result = resolver.resolve(uri).and_then(|path| {
                trace!(request_id, path = %path.display(), "Reading local image");
                read_file(&path)
            });
            match result {
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
                    debug!(request_id, uri = %uri.as_str(), error = %e, "Local read failed");
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

/// Serves the thumbnail embedded in a local JPEG's EXIF data.
///
/// Produces `None` for files without one.
pub struct LocalExifThumbnailProducer {
    resolver: Arc<dyn LocalSourceResolver>,
    executor: Arc<dyn Executor>,
    decoder: Arc<dyn ImageDecoder>,
}

impl LocalExifThumbnailProducer {
    pub fn new(
        resolver: Arc<dyn LocalSourceResolver>,
        executor: Arc<dyn Executor>,
        decoder: Arc<dyn ImageDecoder>,
    ) -> Self {
        Self {
            resolver,
            executor,
            decoder,
        }
    }
}

fn read_exif_thumbnail(
    resolver: &dyn LocalSourceResolver,
    decoder: &dyn ImageDecoder,
    uri: &ImageUri,
) -> Result<Option<EncodedImage>, FetchError> {
    let data = read_file(&resolver.resolve(uri)?)?;
    let Some(thumbnail) = find_exif_thumbnail(&data) else {
        return Ok(None);
    };
    let mut image = EncodedImage::from_bytes(data.slice(thumbnail.range));
    if let Some(metadata) = image.data().and_then(|bytes| decoder.probe(bytes)) {
        image.apply_metadata(&metadata);
    }
    image.set_rotation_angle(thumbnail.rotation_angle);
    Ok(Some(image))
}

impl Producer<EncodedImage> for LocalExifThumbnailProducer {
    fn produce(&self, consumer: Arc<dyn Consumer<EncodedImage>>, context: ProducerContext) {
        context
            .listener()
            .on_producer_start(context.id(), EXIF_PRODUCER_NAME);
        let resolver = Arc::clone(&self.resolver);
        let decoder = Arc::clone(&self.decoder);
        self.executor.execute(Box::new(move || {
            let listener = context.listener();
            let request_id = context.id();
            if context.is_cancelled() {
                listener.on_producer_finish_with_cancellation(request_id, EXIF_PRODUCER_NAME);
                consumer.on_cancellation();
                return;
            }

            match read_exif_thumbnail(resolver.as_ref(), decoder.as_ref(), context.request().uri()) {
                Ok(thumbnail) => {
                    listener.on_producer_finish_with_success(
                        request_id,
                        EXIF_PRODUCER_NAME,
                        &[("has_thumbnail", thumbnail.is_some().to_string())],
                    );
                    consumer.on_final_result(thumbnail, Status::NONE);
                }
                Err(e) => {
                    let error = PipelineError::Fetch(e);
                    listener.on_producer_finish_with_failure(
                        request_id,
                        EXIF_PRODUCER_NAME,
                        &error,
                        &[],
                    );
                    consumer.on_failure(error);
                }
            }
        }));
    }

    fn name(&self) -> &'static str {
        EXIF_PRODUCER_NAME
    }
}

impl ThumbnailProducer for LocalExifThumbnailProducer {
    fn can_provide_image_for_size(&self, resize: Option<&ResizeOptions>) -> bool {
        is_image_big_enough(MAX_EXIF_THUMBNAIL_SIZE, MAX_EXIF_THUMBNAIL_SIZE, resize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::image::exif::test_support::jpeg_with_thumbnail;
    use crate::image::{HeapPixelAllocator, ImageCrateDecoder};
    use crate::producer::test_support::{Event, RecordingConsumer};
    use crate::producers::test_support::{context_for, context_with};
    use crate::request::ImageRequest;
    use tempfile::TempDir;

    fn file_request(path: &Path) -> ImageRequest {
        ImageRequest::new(ImageUri::from_path(path).unwrap())
    }

    fn fetch_producer() -> LocalFetchProducer {
        LocalFetchProducer::new(Arc::new(DirectoryResolver::new()), Arc::new(InlineExecutor))
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let canvas = ::image::RgbaImage::new(width, height);
        let mut out = io::Cursor::new(Vec::new());
        canvas.write_to(&mut out, ::image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_resolver_uses_scheme_roots() {
        let resolver = DirectoryResolver::new().with_root(SourceType::LocalAsset, "/srv/assets");
        let asset = ImageUri::parse("asset://icons/star.png").unwrap();
        assert_eq!(
            resolver.resolve(&asset).unwrap(),
            PathBuf::from("/srv/assets/icons/star.png")
        );

        let resource = ImageUri::parse("res://drawable/logo.png").unwrap();
        assert_eq!(
            resolver.resolve(&resource),
            Err(FetchError::UnsupportedSource("local_resource".to_string()))
        );
    }

    #[test]
    fn test_reads_file_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"\xFF\xD8\xFFjpeg").unwrap();

        let consumer = RecordingConsumer::<EncodedImage>::new();
        fetch_producer().produce(consumer.clone(), context_with(file_request(&path)));

        let events = consumer.events.lock();
        let [Event::Final(Some(image))] = &events[..] else {
            panic!("expected a single final image");
        };
        assert_eq!(image.data().unwrap().as_ref(), b"\xFF\xD8\xFFjpeg");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let consumer = RecordingConsumer::<EncodedImage>::new();
        fetch_producer().produce(
            consumer.clone(),
            context_with(file_request(&dir.path().join("missing.jpg"))),
        );

        assert!(matches!(
            consumer.events.lock()[..],
            [Event::Failure(PipelineError::Fetch(FetchError::NotFound(_)))]
        ));
    }

    #[test]
    fn test_cancelled_before_read() {
        let consumer = RecordingConsumer::<EncodedImage>::new();
        let context = context_for("file:///tmp/a.jpg");
        context.cancel();
        fetch_producer().produce(consumer.clone(), context);

        assert!(matches!(consumer.events.lock()[..], [Event::Cancellation]));
    }

    #[test]
    fn test_exif_thumbnail_is_extracted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, jpeg_with_thumbnail(&png_bytes(400, 300), 6)).unwrap();

        let decoder = Arc::new(ImageCrateDecoder::new(Arc::new(HeapPixelAllocator::new())));
        let producer = LocalExifThumbnailProducer::new(
            Arc::new(DirectoryResolver::new()),
            Arc::new(InlineExecutor),
            decoder,
        );
        let consumer = RecordingConsumer::<EncodedImage>::new();
        producer.produce(consumer.clone(), context_with(file_request(&path)));

        let events = consumer.events.lock();
        let [Event::Final(Some(thumbnail))] = &events[..] else {
            panic!("expected a thumbnail");
        };
        assert_eq!(thumbnail.width(), Some(400));
        assert_eq!(thumbnail.rotation_angle(), 90);
    }

    #[test]
    fn test_file_without_exif_has_no_thumbnail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.png");
        std::fs::write(&path, png_bytes(8, 8)).unwrap();

        let decoder = Arc::new(ImageCrateDecoder::new(Arc::new(HeapPixelAllocator::new())));
        let producer = LocalExifThumbnailProducer::new(
            Arc::new(DirectoryResolver::new()),
            Arc::new(InlineExecutor),
            decoder,
        );
        let consumer = RecordingConsumer::<EncodedImage>::new();
        producer.produce(consumer.clone(), context_with(file_request(&path)));

        assert!(matches!(consumer.events.lock()[..], [Event::Final(None)]));
    }

    #[test]
    fn test_exif_thumbnail_serves_small_sizes_only() {
        let producer = LocalExifThumbnailProducer::new(
            Arc::new(DirectoryResolver::new()),
            Arc::new(InlineExecutor),
            Arc::new(ImageCrateDecoder::new(Arc::new(HeapPixelAllocator::new()))),
        );
        assert!(producer.can_provide_image_for_size(Some(&ResizeOptions::new(300, 300))));
        assert!(!producer.can_provide_image_for_size(Some(&ResizeOptions::new(1000, 1000))));
        assert!(!producer.can_provide_image_for_size(None));
    }
}
