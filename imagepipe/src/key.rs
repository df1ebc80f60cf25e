//! Cache keys for the three cache tiers.
//!
//! Encoded keys identify the source bytes and are shared by every transform
//! of the same URI. Decoded keys additionally capture everything that changes
//! the decoded pixels, so `a.jpg@100x100` and `a.jpg@200x200` share one disk
//! entry but occupy separate decoded-cache entries.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::request::{
    CallerContext, ImageDecodeOptions, ImageRequest, ImageUri, ResizeOptions, RotationOptions,
};

/// Key for encoded bytes (encoded memory cache and disk cache).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedCacheKey {
    uri: ImageUri,
    salt: Option<String>,
}

/// Identity of a postprocessor within a decoded key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PostprocessorKey {
    pub name: String,
    pub cache_id: String,
}

/// Key for decoded images (decoded memory cache).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecodedCacheKey {
    uri: ImageUri,
    resize: Option<ResizeOptions>,
    rotation: RotationOptions,
    decode_options: ImageDecodeOptions,
    postprocessor: Option<PostprocessorKey>,
    salt: Option<String>,
}

impl DecodedCacheKey {
    pub fn resize(&self) -> Option<&ResizeOptions> {
        self.resize.as_ref()
    }

    pub fn postprocessor(&self) -> Option<&PostprocessorKey> {
        self.postprocessor.as_ref()
    }
}

/// A key into any cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Encoded(EncodedCacheKey),
    Decoded(DecodedCacheKey),
}

impl CacheKey {
    pub fn uri(&self) -> &ImageUri {
        match self {
            Self::Encoded(key) => &key.uri,
            Self::Decoded(key) => &key.uri,
        }
    }

    /// Whether this key was derived from `uri`; used for URI-wide eviction.
    pub fn contains_uri(&self, uri: &ImageUri) -> bool {
        self.uri() == uri
    }

    pub fn uri_string(&self) -> &str {
        self.uri().as_str()
    }

    /// Stable file-name-safe identifier: hex SHA-256 over the key fields.
    ///
    /// Every field is length-prefixed, so text inside the URI can never be
    /// mistaken for a field boundary.
    pub fn resource_id(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Self::Encoded(key) => {
                hash_field(&mut hasher, b"encoded");
                hash_field(&mut hasher, key.uri.as_str().as_bytes());
                hash_optional(&mut hasher, key.salt.as_deref());
            }
            Self::Decoded(key) => {
                hash_field(&mut hasher, b"decoded");
                hash_field(&mut hasher, key.uri.as_str().as_bytes());
                let resize = key.resize.map(|resize| resize.to_string());
                hash_optional(&mut hasher, resize.as_deref());
                hash_field(&mut hasher, key.rotation.to_string().as_bytes());
                hash_field(&mut hasher, key.decode_options.to_string().as_bytes());
                hash_optional(&mut hasher, key.postprocessor.as_ref().map(|pp| pp.name.as_str()));
                hash_optional(
                    &mut hasher,
                    key.postprocessor.as_ref().map(|pp| pp.cache_id.as_str()),
                );
                hash_optional(&mut hasher, key.salt.as_deref());
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn is_encoded(&self) -> bool {
        matches!(self, Self::Encoded(_))
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_optional(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        Some(value) => {
            hasher.update([1u8]);
            hash_field(hasher, value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encoded(key) => {
                write!(f, "{}", key.uri)?;
                if let Some(salt) = &key.salt {
                    write!(f, "#salt={}", salt)?;
                }
                Ok(())
            }
            Self::Decoded(key) => {
                write!(f, "{}", key.uri)?;
                match &key.resize {
                    Some(resize) => write!(f, "|resize={}", resize)?,
                    None => f.write_str("|resize=none")?,
                }
                write!(f, "|rotation={}|decode={}", key.rotation, key.decode_options)?;
                if let Some(pp) = &key.postprocessor {
                    write!(f, "|pp={}:{}", pp.name, pp.cache_id)?;
                }
                if let Some(salt) = &key.salt {
                    write!(f, "#salt={}", salt)?;
                }
                Ok(())
            }
        }
    }
}

/// Derives cache keys from requests.
pub trait CacheKeyFactory: Send + Sync {
    fn decoded_cache_key(&self, request: &ImageRequest, caller: &CallerContext) -> CacheKey;

    /// Key for a postprocessed result. Falls back to the plain decoded key
    /// when the request has no cacheable postprocessor.
    fn postprocessed_cache_key(&self, request: &ImageRequest, caller: &CallerContext)
        -> CacheKey;

    fn encoded_cache_key(&self, request: &ImageRequest, caller: &CallerContext) -> CacheKey;
}

/// Stateless factory deriving keys from the request fields directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCacheKeyFactory;

impl DefaultCacheKeyFactory {
    fn decoded_key(
        request: &ImageRequest,
        caller: &CallerContext,
        postprocessor: Option<PostprocessorKey>,
    ) -> CacheKey {
        CacheKey::Decoded(DecodedCacheKey {
            uri: request.uri().clone(),
            resize: request.resize().copied(),
            rotation: request.rotation(),
            decode_options: *request.decode_options(),
            postprocessor,
            salt: caller.cache_salt.clone(),
        })
    }
}

impl CacheKeyFactory for DefaultCacheKeyFactory {
    fn decoded_cache_key(&self, request: &ImageRequest, caller: &CallerContext) -> CacheKey {
        Self::decoded_key(request, caller, None)
    }

    fn postprocessed_cache_key(
        &self,
        request: &ImageRequest,
        caller: &CallerContext,
    ) -> CacheKey {
        let postprocessor = request.postprocessor().and_then(|pp| {
            pp.cache_id().map(|cache_id| PostprocessorKey {
                name: pp.name().to_string(),
                cache_id,
            })
        });
        Self::decoded_key(request, caller, postprocessor)
    }

    fn encoded_cache_key(&self, request: &ImageRequest, caller: &CallerContext) -> CacheKey {
        CacheKey::Encoded(EncodedCacheKey {
            uri: request.uri().clone(),
            salt: caller.cache_salt.clone(),
        })
    }
}

/// Encoded key for `uri` without caller salt.
pub fn encoded_key_for_uri(uri: &ImageUri) -> CacheKey {
    CacheKey::Encoded(EncodedCacheKey {
        uri: uri.clone(),
        salt: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &CacheKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn request(size: u32) -> ImageRequest {
        ImageRequest::from_uri("https://example.com/a.jpg")
            .unwrap()
            .with_resize(ResizeOptions::new(size, size))
    }

    #[test]
    fn test_equal_requests_produce_equal_keys() {
        let factory = DefaultCacheKeyFactory;
        let caller = CallerContext::default();
        let a = factory.decoded_cache_key(&request(100), &caller);
        let b = factory.decoded_cache_key(&request(100), &caller);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_transforms_split_decoded_tier_only() {
        let factory = DefaultCacheKeyFactory;
        let caller = CallerContext::default();

        let small = factory.decoded_cache_key(&request(100), &caller);
        let large = factory.decoded_cache_key(&request(200), &caller);
        assert_ne!(small, large);

        let small_enc = factory.encoded_cache_key(&request(100), &caller);
        let large_enc = factory.encoded_cache_key(&request(200), &caller);
        assert_eq!(small_enc, large_enc);
    }

    #[test]
    fn test_salt_partitions_keys() {
        let factory = DefaultCacheKeyFactory;
        let plain = factory.encoded_cache_key(&request(100), &CallerContext::default());
        let salted = factory.encoded_cache_key(
            &request(100),
            &CallerContext::default().with_cache_salt("tenant"),
        );
        assert_ne!(plain, salted);
        assert_ne!(plain.resource_id(), salted.resource_id());
    }

    #[test]
    fn test_resource_id_is_stable_hex() {
        let key = encoded_key_for_uri(&ImageUri::parse("https://example.com/a.jpg").unwrap());
        let id = key.resource_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, key.clone().resource_id());
    }

    #[test]
    fn test_fragment_cannot_impersonate_salt() {
        let factory = DefaultCacheKeyFactory;
        let fragment = ImageRequest::from_uri("https://example.com/a.jpg#salt=x").unwrap();
        let plain = ImageRequest::from_uri("https://example.com/a.jpg").unwrap();

        let unsalted = factory.encoded_cache_key(&fragment, &CallerContext::default());
        let salted =
            factory.encoded_cache_key(&plain, &CallerContext::default().with_cache_salt("x"));
        assert_ne!(unsalted, salted);
        assert_ne!(unsalted.resource_id(), salted.resource_id());
    }

    #[test]
    fn test_contains_uri() {
        let uri = ImageUri::parse("https://example.com/a.jpg").unwrap();
        let other = ImageUri::parse("https://example.com/b.jpg").unwrap();
        let key = DefaultCacheKeyFactory.decoded_cache_key(&request(10), &CallerContext::default());
        assert!(key.contains_uri(&uri));
        assert!(!key.contains_uri(&other));
    }
}
