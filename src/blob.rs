use crate::{Result, ThumbnailSize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// Which subdirectory of the storage root a blob lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Originals,
    Thumbnails,
}

impl BlobKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            BlobKind::Originals => "originals",
            BlobKind::Thumbnails => "thumbnails",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "originals" => Some(BlobKind::Originals),
            "thumbnails" => Some(BlobKind::Thumbnails),
            _ => None,
        }
    }
}

/// Filesystem blob storage rooted at one directory:
///
/// ```text
/// {root}/originals/{id}{ext}
/// {root}/thumbnails/{id}_{w}x{h}.jpg
/// ```
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for kind in [BlobKind::Originals, BlobKind::Thumbnails] {
            fs::create_dir_all(root.join(kind.dir_name())).await?;
        }
        Ok(Self { root })
    }

    pub fn original_path(&self, id: Uuid, filename: &str) -> PathBuf {
        let ext = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.root
            .join(BlobKind::Originals.dir_name())
            .join(format!("{id}{ext}"))
    }

    pub fn thumbnail_path(&self, id: Uuid, size: ThumbnailSize) -> PathBuf {
        self.root
            .join(BlobKind::Thumbnails.dir_name())
            .join(format!("{id}_{}.jpg", size.label()))
    }

    pub async fn write_original(&self, id: Uuid, filename: &str, bytes: &[u8]) -> Result<String> {
        let path = self.original_path(id, filename);
        write_atomic(&path, bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "Original stored");
        Ok(path.to_string_lossy().into_owned())
    }

    pub async fn write_thumbnail(
        &self,
        id: Uuid,
        size: ThumbnailSize,
        bytes: &[u8],
    ) -> Result<String> {
        let path = self.thumbnail_path(id, size);
        write_atomic(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        Ok(fs::read(path).await?)
    }

    pub async fn exists(&self, path: &str) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Maps a public `{kind}/{name}` pair to a file under the root. Names
    /// that could step outside their directory resolve to nothing.
    pub fn resolve(&self, kind: BlobKind, name: &str) -> Option<PathBuf> {
        let plain = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && Path::new(name).file_name().map(|f| f == name).unwrap_or(false);
        plain.then(|| self.root.join(kind.dir_name()).join(name))
    }
}

/// File name part of a stored path, as used in public URLs.
pub fn public_name(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|n| n.to_str())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    if let Err(err) = fs::write(&tmp, bytes).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    fs::rename(&tmp, path).await?;
    Ok(())
}
