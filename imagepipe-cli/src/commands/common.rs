//! Common types and utilities shared across CLI commands.

use std::path::Path;

use clap::ValueEnum;
use imagepipe::request::{CacheChoice, ImageRequest, ImageUri, ResizeOptions};

use crate::error::CliError;

/// Disk cache selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum CacheTarget {
    /// The main disk cache
    #[default]
    Main,
    /// The small-image disk cache (thumbnails, avatars)
    Small,
}

impl From<CacheTarget> for CacheChoice {
    fn from(target: CacheTarget) -> Self {
        match target {
            CacheTarget::Main => CacheChoice::Default,
            CacheTarget::Small => CacheChoice::Small,
        }
    }
}

/// Parses a CLI source argument. Absolute paths become `file://` URIs.
pub fn parse_source(source: &str) -> Result<ImageUri, CliError> {
    let path = Path::new(source);
    if path.is_absolute() {
        return Ok(ImageUri::from_path(path)?);
    }
    Ok(ImageUri::parse(source)?)
}

/// Builds a request from the shared CLI options.
pub fn build_request(
    source: &str,
    resize: Option<(u32, u32)>,
    cache: CacheTarget,
) -> Result<ImageRequest, CliError> {
    let mut request = ImageRequest::new(parse_source(source)?).with_cache_choice(cache.into());
    if let Some((width, height)) = resize {
        request = request.with_resize(ResizeOptions::new(width, height));
    }
    Ok(request)
}

/// Parses `WIDTHxHEIGHT`.
pub fn parse_dimensions(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
    let parse = |part: &str| {
        part.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("invalid dimension '{}'", part))
    };
    Ok((parse(width)?, parse(height)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagepipe::request::SourceType;

    #[test]
    fn test_parse_dimensions() {
        assert_eq!(parse_dimensions("200x100"), Ok((200, 100)));
        assert_eq!(parse_dimensions("64X64"), Ok((64, 64)));
        assert!(parse_dimensions("200").is_err());
        assert!(parse_dimensions("0x10").is_err());
        assert!(parse_dimensions("axb").is_err());
    }

    #[test]
    fn test_absolute_path_becomes_file_uri() {
        let uri = parse_source("/tmp/cat.png").unwrap();
        assert_eq!(uri.source_type(), SourceType::LocalFile);
        assert!(uri.as_str().starts_with("file://"));
    }

    #[test]
    fn test_build_request_applies_options() {
        let request =
            build_request("https://example.com/a.jpg", Some((32, 16)), CacheTarget::Small)
                .unwrap();
        assert_eq!(request.cache_choice(), CacheChoice::Small);
        assert_eq!(request.resize().map(|r| (r.width, r.height)), Some((32, 16)));
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert!(matches!(
            parse_source("gopher://example.com/a.jpg"),
            Err(CliError::InvalidUri(_))
        ));
    }
}
