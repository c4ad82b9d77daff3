use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use newsviews_core::capabilities::ImageStore;
use newsviews_core::error::AppError;
use tracing::{debug, info, warn};

/// Where an image reference taken from a submission points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageLocation {
    /// Empty, or an `http`/`https` URL owned by someone else.
    Remote,
    /// A relative path under the upload directory, not yet resolved on disk.
    Local { root: PathBuf, path: PathBuf },
    /// A local reference that must not be touched.
    Refused(String),
}

/// Classifies an image reference against the upload directory.
///
/// Local references must be relative paths made only of plain file and
/// directory names. Absolute paths, `..` and drive prefixes are refused, as
/// is every local reference when no upload directory is configured.
pub fn locate(image_reference: &str, root: Option<&Path>) -> ImageLocation {
    let reference = image_reference.trim();
    if reference.is_empty() {
        return ImageLocation::Remote;
    }
    let lower = reference.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return ImageLocation::Remote;
    }

    let Some(root) = root else {
        return ImageLocation::Refused("no image directory configured".to_string());
    };

    let path = Path::new(reference.strip_prefix("file://").unwrap_or(reference));
    let plain = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    let names_file = path.components().any(|c| matches!(c, Component::Normal(_)));
    if !plain || !names_file {
        return ImageLocation::Refused(format!(
            "image path {} escapes the upload directory",
            path.display()
        ));
    }

    ImageLocation::Local {
        root: root.to_path_buf(),
        path: root.join(path),
    }
}

/// Resolves `path` on disk and returns it only if it still lies under `root`
/// once symlinks are followed.
///
/// # Errors
///
/// Returns the I/O error from canonicalization, `NotFound` when the file is
/// missing.
pub async fn confined(path: &Path, root: &Path) -> std::io::Result<Option<PathBuf>> {
    let root = tokio::fs::canonicalize(root).await?;
    let resolved = tokio::fs::canonicalize(path).await?;
    Ok(resolved.starts_with(&root).then_some(resolved))
}

/// [`ImageStore`] for images uploaded to the local filesystem.
///
/// Only files under `root` are ever removed. Remote URLs are owned elsewhere
/// and released as a no-op, and so is every reference [`locate`] refuses.
#[derive(Debug, Clone, Default)]
pub struct LocalImageStore {
    root: Option<PathBuf>,
}

impl LocalImageStore {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn release(&self, image_reference: &str) -> Result<(), AppError> {
        let (root, path) = match locate(image_reference, self.root.as_deref()) {
            ImageLocation::Remote => {
                debug!(image = %image_reference, "Remote image, nothing to release");
                return Ok(());
            }
            ImageLocation::Refused(reason) => {
                warn!(image = %image_reference, %reason, "Refusing to release image");
                return Ok(());
            }
            ImageLocation::Local { root, path } => (root, path),
        };

        let resolved = match confined(&path, &root).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                warn!(path = %path.display(), "Image resolves outside the upload directory, not released");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Image already gone");
                return Ok(());
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        match tokio::fs::remove_file(&resolved).await {
            Ok(()) => {
                info!(path = %resolved.display(), "Released image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}
