//! Image source URIs and their classification.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use url::Url;

use super::RequestError;

/// Where an image's encoded bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    /// `http://` and `https://`
    Network,
    /// `file://`
    LocalFile,
    /// `content://`, resolved by a host-provided resolver
    LocalContent,
    /// `asset://`, resolved against the asset root
    LocalAsset,
    /// `res://`, resolved against the resource root
    LocalResource,
    /// `data:` URIs carrying the bytes inline
    Data,
}

impl SourceType {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" | "https" => Some(Self::Network),
            "file" => Some(Self::LocalFile),
            "content" => Some(Self::LocalContent),
            "asset" => Some(Self::LocalAsset),
            "res" => Some(Self::LocalResource),
            "data" => Some(Self::Data),
            _ => None,
        }
    }

    /// Whether bytes are read from the local device rather than fetched.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::LocalFile | Self::LocalContent | Self::LocalAsset | Self::LocalResource
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::LocalFile => "local_file",
            Self::LocalContent => "local_content",
            Self::LocalAsset => "local_asset",
            Self::LocalResource => "local_resource",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed image URI with a supported scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageUri {
    url: Url,
    source_type: SourceType,
}

impl ImageUri {
    /// Parses `input`, rejecting schemes the pipeline has no fetcher for.
    pub fn parse(input: &str) -> Result<Self, RequestError> {
        let url = Url::parse(input).map_err(|e| RequestError::InvalidUri {
            uri: input.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self, RequestError> {
        let source_type = SourceType::from_scheme(url.scheme())
            .ok_or_else(|| RequestError::UnsupportedScheme(url.scheme().to_string()))?;
        Ok(Self { url, source_type })
    }

    /// Builds a `file://` URI from an absolute path.
    pub fn from_path(path: &Path) -> Result<Self, RequestError> {
        let url = Url::from_file_path(path).map_err(|_| RequestError::InvalidUri {
            uri: path.display().to_string(),
            reason: "path must be absolute".to_string(),
        })?;
        Self::from_url(url)
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The local path for `file://` URIs.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        match self.source_type {
            SourceType::LocalFile => self.url.to_file_path().ok(),
            _ => None,
        }
    }

    /// Host plus path with the leading slash removed, used to resolve
    /// `asset://` and `res://` URIs against a root directory.
    pub fn relative_path(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let path = self.url.path().trim_start_matches('/');
        match (host.is_empty(), path.is_empty()) {
            (true, _) => path.to_string(),
            (false, true) => host.to_string(),
            (false, false) => format!("{}/{}", host, path),
        }
    }
}

impl FromStr for ImageUri {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_by_scheme() {
        let cases = [
            ("https://example.com/a.jpg", SourceType::Network),
            ("http://example.com/a.jpg", SourceType::Network),
            ("file:///tmp/a.png", SourceType::LocalFile),
            ("content://media/external/1", SourceType::LocalContent),
            ("asset:///icons/a.png", SourceType::LocalAsset),
            ("res:///logo.png", SourceType::LocalResource),
            ("data:image/png;base64,AAAA", SourceType::Data),
        ];
        for (input, expected) in cases {
            assert_eq!(ImageUri::parse(input).unwrap().source_type(), expected, "{}", input);
        }
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let err = ImageUri::parse("ftp://example.com/a.jpg").unwrap_err();
        assert!(matches!(err, RequestError::UnsupportedScheme(s) if s == "ftp"));
    }

    #[test]
    fn test_invalid_uri_rejected() {
        assert!(matches!(
            ImageUri::parse("not a uri"),
            Err(RequestError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_relative_path_for_assets() {
        let uri = ImageUri::parse("asset://icons/app/logo.png").unwrap();
        assert_eq!(uri.relative_path(), "icons/app/logo.png");

        let uri = ImageUri::parse("res:///logo.png").unwrap();
        assert_eq!(uri.relative_path(), "logo.png");
    }

    #[test]
    fn test_file_path_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        let uri = ImageUri::from_path(&path).unwrap();
        assert_eq!(uri.source_type(), SourceType::LocalFile);
        assert_eq!(uri.to_file_path().unwrap(), path);
    }
}
