use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("no {image} image available for version {version}")]
    NotFound { image: String, version: String },

    #[error("invalid image name or version: {0}")]
    Invalid(String),
}

/// Source of auxiliary images (bootloader, radio) that a build does not ship itself.
pub trait FlashingResourceProvider: Send + Sync {
    fn retrieve(&self, image_name: &str, version: &str) -> Result<PathBuf, ResourceError>;
}

/// Provider used when no resource store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

impl FlashingResourceProvider for NoResources {
    fn retrieve(&self, image_name: &str, version: &str) -> Result<PathBuf, ResourceError> {
        Err(ResourceError::NotFound {
            image: image_name.to_string(),
            version: version.to_string(),
        })
    }
}

/// Looks images up in a local directory tree.
///
/// Accepted layouts, in order: `<root>/<name>/<version>.img`,
/// `<root>/<name>-<version>.img`, `<root>/<name>.<version>.img`.
#[derive(Debug, Clone)]
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidates(&self, image_name: &str, version: &str) -> [PathBuf; 3] {
        [
            self.root.join(image_name).join(format!("{version}.img")),
            self.root.join(format!("{image_name}-{version}.img")),
            self.root.join(format!("{image_name}.{version}.img")),
        ]
    }
}

fn validate_component(value: &str) -> Result<(), ResourceError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') || trimmed == ".." {
        return Err(ResourceError::Invalid(value.to_string()));
    }
    Ok(())
}

impl FlashingResourceProvider for DirectoryResources {
    fn retrieve(&self, image_name: &str, version: &str) -> Result<PathBuf, ResourceError> {
        validate_component(image_name)?;
        validate_component(version)?;
        for candidate in self.candidates(image_name, version) {
            if is_file(&candidate) {
                debug!(image = %image_name, version = %version, path = %candidate.display(), "resolved flashing resource");
                return Ok(candidate);
            }
        }
        Err(ResourceError::NotFound {
            image: image_name.to_string(),
            version: version.to_string(),
        })
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|meta| meta.is_file()).unwrap_or(false)
}
