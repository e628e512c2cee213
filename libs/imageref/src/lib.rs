//! # scanhub-imageref
//!
//! Container image reference parsing for the scanhub platform.
//!
//! An image string as written in a pod spec (`nginx:1.21`,
//! `localhost:5000/myimage:latest`, `nginx@sha256:...`) and the image ID
//! reported by the container runtime (`docker-pullable://nginx@sha256:...`)
//! carry the three coordinates scanhub cares about: repository, tag, and
//! content digest. This crate turns those strings into an [`ImageReference`]
//! without ever guessing: a registry `host:port` colon is never mistaken for
//! a tag separator, and a missing digest stays missing until the runtime
//! reports one.

use serde::{Deserialize, Serialize};

/// Digest algorithm prefixes accepted as already-resolved digests.
pub const DIGEST_ALGORITHM_PREFIXES: &[&str] = &["sha256:", "sha512:"];

/// A parsed container image reference.
///
/// `digest` is `None` until the runtime has reported a resolved image ID
/// for the running container; the repository and tag alone do not identify
/// image content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Repository, including any registry host (`localhost:5000/myimage`).
    pub repository: String,

    /// Tag, defaulting to `latest` when the image string carries none.
    pub tag: String,

    /// Content digest (`sha256:<hex>`), once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageReference {
    /// Build a reference from a pod-spec image string and an optional
    /// runtime-reported image ID.
    pub fn from_runtime(image: &str, image_id: &str) -> Self {
        let (repository, tag) = parse_image_name(image);
        Self {
            repository,
            tag,
            digest: extract_digest_from_image_id(image_id),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Split an image string into (repository, tag).
///
/// The tag separator is the last `:` that occurs after the last `/`, so a
/// registry `host:port` colon is never mistaken for one. A trailing
/// `@digest` suffix is stripped before tag extraction. The tag defaults to
/// `latest` when absent.
pub fn parse_image_name(image: &str) -> (String, String) {
    // Everything after the first `@` is digest material, not name material.
    let name = image.split('@').next().unwrap_or(image);

    let last_slash = name.rfind('/');
    match name.rfind(':') {
        Some(colon) if last_slash.is_none_or(|slash| colon > slash) => {
            let tag = &name[colon + 1..];
            if tag.is_empty() {
                (name[..colon].to_string(), "latest".to_string())
            } else {
                (name[..colon].to_string(), tag.to_string())
            }
        }
        _ => (name.to_string(), "latest".to_string()),
    }
}

/// Extract the content digest from a runtime-reported image ID.
///
/// Image IDs usually look like `docker-pullable://nginx@sha256:<hex>`; the
/// digest is whatever follows the first `@`, truncated at a second `@` to
/// guard against malformed multi-`@` strings. Some runtimes report the bare
/// digest itself, which is accepted when it carries a known algorithm
/// prefix. Anything else yields `None`, never an error.
pub fn extract_digest_from_image_id(image_id: &str) -> Option<String> {
    if let Some((_, rest)) = image_id.split_once('@') {
        let digest = rest.split('@').next().unwrap_or(rest);
        if digest.is_empty() {
            None
        } else {
            Some(digest.to_string())
        }
    } else if DIGEST_ALGORITHM_PREFIXES
        .iter()
        .any(|prefix| image_id.starts_with(prefix))
    {
        Some(image_id.to_string())
    } else {
        None
    }
}

/// Normalize a digest for lookup: a bare 64-hex-char string gains the
/// `sha256:` prefix, everything else passes through unchanged.
pub fn normalize_digest(digest: &str) -> String {
    if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        format!("sha256:{digest}")
    } else {
        digest.to_string()
    }
}

/// Extract the runtime name from a runtime container ID.
///
/// Container IDs carry the runtime as a URL-ish scheme:
/// `containerd://6a95e...` → `containerd`.
pub fn runtime_from_container_id(container_id: &str) -> Option<String> {
    container_id
        .split_once("://")
        .map(|(scheme, _)| scheme.to_string())
        .filter(|scheme| !scheme.is_empty())
}

/// Map a digest onto a filesystem- and header-safe token: `[A-Za-z0-9._-]`
/// pass through, everything else (notably the `:` after the algorithm)
/// becomes `_`.
pub fn sanitize_for_filename(digest: &str) -> String {
    digest
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
