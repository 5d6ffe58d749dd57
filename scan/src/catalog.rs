//! Photo sources and the per-photo face extraction seam.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use facegroup_faceprint::{EmbeddingGenerator, FaceEmbedding, FaceprintError, decode_image};

use crate::error::{Result, ScanError};

/// A photo known to a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub id: String,
    pub modified: DateTime<Utc>,
}

/// An enumerable, appendable photo library.
#[async_trait]
pub trait PhotoCatalog: Send + Sync {
    /// Photos modified after `since` (all photos with `None`), in any order.
    async fn enumerate(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PhotoRef>>;

    /// Encoded bytes of one photo.
    async fn load(&self, photo: &PhotoRef) -> Result<Vec<u8>>;
}

/// Turns one loaded photo into face embeddings. Runs on a blocking thread.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, photo: &PhotoRef, data: &[u8]) -> std::result::Result<Vec<FaceEmbedding>, FaceprintError>;
}

impl FaceExtractor for EmbeddingGenerator {
    fn extract(&self, _photo: &PhotoRef, data: &[u8]) -> std::result::Result<Vec<FaceEmbedding>, FaceprintError> {
        let image = decode_image(data)?;
        self.process(&image)
    }
}

/// Image files under a directory tree. Photo ids are paths relative to the
/// root, with `/` separators.
pub struct DirCatalog {
    root: PathBuf,
    extensions: Vec<String>,
}

impl DirCatalog {
    pub const DEFAULT_EXTENSIONS: &'static [&'static str] = &["jpg", "jpeg", "png", "webp"];

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: Self::DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn wanted(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
    }

    fn photo_id(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel.iter().map(|p| p.to_str()).collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

#[async_trait]
impl PhotoCatalog for DirCatalog {
    async fn enumerate(&self, since: Option<DateTime<Utc>>) -> Result<Vec<PhotoRef>> {
        let mut out = Vec::new();
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| ScanError::Catalog(format!("read {}: {e}", dir.display())))?;
            while let Some(entry) = entries.next_entry().await.map_err(ScanError::catalog)? {
                let path = entry.path();
                let meta = entry.metadata().await.map_err(ScanError::catalog)?;
                if meta.is_dir() {
                    dirs.push(path);
                    continue;
                }
                if !meta.is_file() || !self.wanted(&path) {
                    continue;
                }
                let modified: DateTime<Utc> = match meta.modified() {
                    Ok(t) => t.into(),
                    Err(_) => Utc::now(),
                };
                if since.is_some_and(|s| modified <= s) {
                    continue;
                }
                if let Some(id) = self.photo_id(&path) {
                    out.push(PhotoRef { id, modified });
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn load(&self, photo: &PhotoRef) -> Result<Vec<u8>> {
        let path = photo.id.split('/').fold(self.root.clone(), |p, part| p.join(part));
        tokio::fs::read(&path)
            .await
            .map_err(|e| ScanError::Catalog(format!("read {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dir_catalog_walks_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("2024/trip")).unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("2024/trip/b.PNG"), b"bb").unwrap();

        let cat = DirCatalog::new(dir.path());
        let photos = cat.enumerate(None).await.unwrap();
        let ids: Vec<&str> = photos.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["2024/trip/b.PNG", "a.jpg"]);
        assert_eq!(cat.load(&photos[0]).await.unwrap(), b"bb");

        let newest = photos.iter().map(|p| p.modified).max().unwrap();
        assert!(cat.enumerate(Some(newest)).await.unwrap().is_empty());
    }
}
