//! Image reference parsing.
//!
//! An image reference has the shape `[registry/]repository[:tag][@digest]`.
//! The first path component is only treated as a registry when it looks like
//! a host: it contains a `.` or a `:` port, or is exactly `localhost`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static PATH_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("valid regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("valid regex"));
static DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$")
        .expect("valid regex")
});
static REGISTRY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$").expect("valid regex"));

/// Reasons an image string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DockerNameError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid registry '{0}' in image reference")]
    InvalidRegistry(String),
    #[error("invalid repository '{0}' in image reference")]
    InvalidRepository(String),
    #[error("invalid tag '{0}' in image reference")]
    InvalidTag(String),
    #[error("invalid digest '{0}' in image reference")]
    InvalidDigest(String),
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerName {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl DockerName {
    pub fn parse(image: &str) -> Result<Self, DockerNameError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(DockerNameError::Empty);
        }

        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST.is_match(digest) {
                    return Err(DockerNameError::InvalidDigest(digest.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (image, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones are registry ports.
        let last_slash = name.rfind('/');
        let (name, tag) = match name.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                let tag = &name[colon + 1..];
                if !TAG.is_match(tag) {
                    return Err(DockerNameError::InvalidTag(tag.to_string()));
                }
                (&name[..colon], Some(tag.to_string()))
            }
            _ => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                if !REGISTRY.is_match(first) {
                    return Err(DockerNameError::InvalidRegistry(first.to_string()));
                }
                (Some(first.to_string()), rest)
            }
            _ => (None, name),
        };

        if repository.is_empty() || !repository.split('/').all(|c| PATH_COMPONENT.is_match(c)) {
            return Err(DockerNameError::InvalidRepository(repository.to_string()));
        }

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Replace the registry, e.g. to route pulls through a pull-through cache.
    pub fn with_registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    /// Fill in `tag` when the reference names neither a tag nor a digest.
    pub fn with_default_tag(mut self, tag: &str) -> Self {
        if self.tag.is_none() && self.digest.is_none() {
            self.tag = Some(tag.to_string());
        }
        self
    }

    /// `registry/repository` without tag or digest.
    pub fn registry_repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{registry}/{}", self.repository),
            None => self.repository.clone(),
        }
    }
}

impl fmt::Display for DockerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.registry_repository())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for DockerName {
    type Err = DockerNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
