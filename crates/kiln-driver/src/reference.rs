//! Image reference parsing and registry-host normalization.
//!
//! Registry sessions are scoped to a registry host, so every push, pull and
//! login target is reduced to the host it talks to before the session is
//! consulted.

use std::str::FromStr;

use kiln_common::{KilnError, KilnResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (with port, if any).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `myrepo:1.0` -> docker.io/library/myrepo:1.0
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` -> ghcr.io/org/app@sha256:...
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::ImageNotFound`] for an empty reference.
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(KilnError::ImageNotFound {
                reference: reference.to_string(),
            });
        }

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon followed by a slash belongs to a registry port.
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_registry(first) => {
                (normalize_host(first), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (Self::DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Reduce a login target to the registry host it authenticates against.
///
/// Accepts bare hosts (`ghcr.io`, `localhost:5000`), URLs
/// (`https://index.docker.io/v1/`), repositories (`ghcr.io/org/app`) and
/// the empty string, which means the default registry. A single-component
/// image reference such as `myrepo:1.0` lives on the default registry, the
/// same as [`ImageReference::parse`] decides.
#[must_use]
pub fn registry_host(target: &str) -> String {
    let target = target.trim();
    let without_scheme = target
        .strip_prefix("https://")
        .or_else(|| target.strip_prefix("http://"))
        .unwrap_or(target);
    let host = match without_scheme.split_once('/') {
        Some((first, _)) => first,
        None if is_bare_host(without_scheme) => without_scheme,
        None => "",
    };

    if host.is_empty() || !looks_like_registry(host) {
        return ImageReference::DEFAULT_REGISTRY.to_string();
    }
    normalize_host(host)
}

/// Registry host of an image reference, as used for push and pull.
///
/// # Errors
///
/// Returns an error if the reference is empty.
pub fn registry_of(image: &str) -> KilnResult<String> {
    Ok(ImageReference::parse(image)?.registry)
}

/// `host` or `host:port`, as opposed to `name:tag` or `name@digest`.
fn is_bare_host(target: &str) -> bool {
    if target.contains('@') {
        return false;
    }
    match target.split_once(':') {
        Some((name, port)) => {
            !name.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())
        }
        None => true,
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn normalize_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com" => {
            ImageReference::DEFAULT_REGISTRY.to_string()
        }
        _ => host,
    }
}
