// Path: crates/worker/src/store.rs
//! The resource store seam.
//!
//! Docker daemon interaction is an external collaborator; the executor
//! and data listener work against this trait. The filesystem
//! implementation keeps exported resources as flat files under
//! `<data_dir>/resources/` and is what the binaries and tests run on:
//! volumes and images as tar streams, container bundles as tars,
//! network definitions as small JSON documents carried with containers.

use gantry_ipc::v1 as proto;
use gantry_types::error::TransferError;
use gantry_types::model::ResourceKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};

/// A reader over a resource byte stream, plus its total length.
pub struct ResourceReader {
    /// Positioned at offset zero.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Stream length in bytes.
    pub total_bytes: u64,
}

/// Writers for a (possibly resumed) inbound resource stream.
pub struct ResourceWriter {
    /// Positioned at the resume offset; existing bytes beyond it are
    /// discarded.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Reads the committed prefix `[0, resume_offset)` for digest
    /// seeding.
    pub existing: Box<dyn AsyncRead + Send + Unpin>,
}

/// What the executor and data listener need from the host's resource
/// backend.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// Enumerates local resources for inventory reports.
    async fn inventory(&self) -> Result<proto::Inventory, TransferError>;

    /// Size of a resource stream in bytes.
    async fn size_of(&self, kind: ResourceKind, id: &str) -> Result<u64, TransferError>;

    /// Opens a resource for streaming out.
    async fn open_reader(&self, kind: ResourceKind, id: &str)
        -> Result<ResourceReader, TransferError>;

    /// Bytes of a partially received resource, zero when none.
    async fn partial_len(&self, kind: ResourceKind, id: &str) -> Result<u64, TransferError>;

    /// Opens a resource for streaming in, truncated to `resume_offset`.
    async fn open_writer(
        &self,
        kind: ResourceKind,
        id: &str,
        resume_offset: u64,
    ) -> Result<ResourceWriter, TransferError>;

    /// Publishes a fully received resource.
    async fn finalize(&self, kind: ResourceKind, id: &str) -> Result<(), TransferError>;

    /// Removes a resource (move-mode source cleanup).
    async fn remove(&self, kind: ResourceKind, id: &str) -> Result<(), TransferError>;
}

/// Filesystem-backed store under `<data_dir>/resources/`.
pub struct FsResourceStore {
    root: PathBuf,
}

impl FsResourceStore {
    /// A store rooted under the node data directory.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("resources"),
        }
    }

    fn dir(&self, kind: ResourceKind) -> PathBuf {
        let sub = match kind {
            ResourceKind::Volume => "volumes",
            ResourceKind::Image => "images",
            ResourceKind::Container => "containers",
            ResourceKind::Network => "networks",
        };
        self.root.join(sub)
    }

    fn extension(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Volume | ResourceKind::Image | ResourceKind::Container => "tar",
            ResourceKind::Network => "json",
        }
    }

    fn path(&self, kind: ResourceKind, id: &str) -> PathBuf {
        self.dir(kind)
            .join(format!("{}.{}", sanitize(id), Self::extension(kind)))
    }

    fn partial_path(&self, kind: ResourceKind, id: &str) -> PathBuf {
        self.dir(kind).join(format!("{}.part", sanitize(id)))
    }

    async fn scan(&self, kind: ResourceKind) -> Vec<(String, u64)> {
        let dir = self.dir(kind);
        let suffix = format!(".{}", Self::extension(kind));
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(&suffix) {
                let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                out.push((stem.to_string(), size));
            }
        }
        out.sort();
        out
    }
}

#[async_trait::async_trait]
impl ResourceStore for FsResourceStore {
    async fn inventory(&self) -> Result<proto::Inventory, TransferError> {
        let volumes = self
            .scan(ResourceKind::Volume)
            .await
            .into_iter()
            .map(|(name, size)| proto::VolumeInfo {
                name,
                driver: "local".into(),
                size_bytes: size,
            })
            .collect();
        let images = self
            .scan(ResourceKind::Image)
            .await
            .into_iter()
            .map(|(id, size)| proto::ImageInfo {
                id,
                tags: Vec::new(),
                size_bytes: size,
            })
            .collect();
        let containers = self
            .scan(ResourceKind::Container)
            .await
            .into_iter()
            .map(|(id, _)| proto::ContainerInfo {
                name: id.clone(),
                id,
                image: String::new(),
                state: "exported".into(),
            })
            .collect();
        let networks = self
            .scan(ResourceKind::Network)
            .await
            .into_iter()
            .map(|(name, _)| proto::NetworkInfo {
                id: name.clone(),
                name,
                driver: "bridge".into(),
            })
            .collect();
        Ok(proto::Inventory {
            containers,
            images,
            volumes,
            networks,
        })
    }

    async fn size_of(&self, kind: ResourceKind, id: &str) -> Result<u64, TransferError> {
        let path = self.path(kind, id);
        tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| TransferError::Resource(format!("{kind} {id}: {e}")))
    }

    async fn open_reader(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> Result<ResourceReader, TransferError> {
        let path = self.path(kind, id);
        let file = File::open(&path)
            .await
            .map_err(|e| TransferError::Resource(format!("{kind} {id}: {e}")))?;
        let total_bytes = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| TransferError::Resource(format!("{kind} {id}: {e}")))?;
        Ok(ResourceReader {
            reader: Box::new(file),
            total_bytes,
        })
    }

    async fn partial_len(&self, kind: ResourceKind, id: &str) -> Result<u64, TransferError> {
        match tokio::fs::metadata(self.partial_path(kind, id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(TransferError::Resource(format!("{kind} {id}: {e}"))),
        }
    }

    async fn open_writer(
        &self,
        kind: ResourceKind,
        id: &str,
        resume_offset: u64,
    ) -> Result<ResourceWriter, TransferError> {
        let dir = self.dir(kind);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", dir.display())))?;
        let path = self.partial_path(kind, id);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;
        if resume_offset > len {
            return Err(TransferError::Resource(format!(
                "cannot resume {kind} {id} at {resume_offset}: only {len} bytes on disk"
            )));
        }
        file.set_len(resume_offset)
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;

        let mut writer = file;
        writer
            .seek(std::io::SeekFrom::Start(resume_offset))
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;

        let existing = File::open(&path)
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", path.display())))?;

        Ok(ResourceWriter {
            writer: Box::new(writer),
            existing: Box::new(existing.take(resume_offset)),
        })
    }

    async fn finalize(&self, kind: ResourceKind, id: &str) -> Result<(), TransferError> {
        let from = self.partial_path(kind, id);
        let to = self.path(kind, id);
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| TransferError::Resource(format!("{}: {e}", to.display())))
    }

    async fn remove(&self, kind: ResourceKind, id: &str) -> Result<(), TransferError> {
        match tokio::fs::remove_file(self.path(kind, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::Resource(format!("{kind} {id}: {e}"))),
        }
    }
}

/// Keeps resource ids filesystem-safe.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn seed_volume(store: &FsResourceStore, name: &str, bytes: &[u8]) {
        let dir = store.dir(ResourceKind::Volume);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.path(ResourceKind::Volume, name), bytes)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn inventory_lists_seeded_resources() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResourceStore::new(dir.path());
        seed_volume(&store, "data", &[1, 2, 3]).await;
        seed_volume(&store, "logs", &[9; 10]).await;

        let inventory = store.inventory().await.unwrap();
        assert_eq!(inventory.volumes.len(), 2);
        assert_eq!(inventory.volumes[0].name, "data");
        assert_eq!(inventory.volumes[0].size_bytes, 3);
        assert!(inventory.images.is_empty());
    }

    #[tokio::test]
    async fn write_finalize_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResourceStore::new(dir.path());
        let payload = vec![42u8; 4096];

        let mut open = store
            .open_writer(ResourceKind::Volume, "data", 0)
            .await
            .unwrap();
        open.writer.write_all(&payload).await.unwrap();
        open.writer.flush().await.unwrap();
        drop(open);
        store.finalize(ResourceKind::Volume, "data").await.unwrap();

        assert_eq!(store.size_of(ResourceKind::Volume, "data").await.unwrap(), 4096);
        let mut reader = store.open_reader(ResourceKind::Volume, "data").await.unwrap();
        let mut back = Vec::new();
        reader.reader.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, payload);
    }

    #[tokio::test]
    async fn resume_truncates_to_the_requested_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResourceStore::new(dir.path());

        let mut open = store
            .open_writer(ResourceKind::Volume, "data", 0)
            .await
            .unwrap();
        open.writer.write_all(&[7u8; 1000]).await.unwrap();
        open.writer.flush().await.unwrap();
        drop(open);
        assert_eq!(store.partial_len(ResourceKind::Volume, "data").await.unwrap(), 1000);

        // Resume at 600: the tail is discarded, the prefix is readable.
        let mut open = store
            .open_writer(ResourceKind::Volume, "data", 600)
            .await
            .unwrap();
        let mut prefix = Vec::new();
        open.existing.read_to_end(&mut prefix).await.unwrap();
        assert_eq!(prefix, vec![7u8; 600]);

        open.writer.write_all(&[8u8; 100]).await.unwrap();
        open.writer.flush().await.unwrap();
        drop(open);
        assert_eq!(store.partial_len(ResourceKind::Volume, "data").await.unwrap(), 700);

        // Resuming past what is on disk is refused.
        assert!(store
            .open_writer(ResourceKind::Volume, "data", 9999)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ids_are_sanitized_for_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResourceStore::new(dir.path());
        let path = store.path(ResourceKind::Image, "nginx:1.25/amd64");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "nginx_1.25_amd64.tar");
    }
}
