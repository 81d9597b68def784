use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{MachineError, Result};

/// Header written at the start of every image file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub id: Uuid,
    pub format: String,
    /// Parent image for differencing images.
    #[serde(default)]
    pub parent: Option<Uuid>,
    pub logical_size_mb: u64,
    pub created_at: DateTime<Utc>,
}

/// Creates and deletes the files backing media.
///
/// Images are represented by a small JSON header; guest data blocks are the
/// business of the VM process and never touched here.
#[derive(Debug, Clone)]
pub struct ImageStore {
    diff_format: String,
}

impl ImageStore {
    pub fn new(diff_format: impl Into<String>) -> Self {
        Self {
            diff_format: diff_format.into(),
        }
    }

    pub fn diff_format(&self) -> &str {
        &self.diff_format
    }

    /// File name of a differencing image with the given ID inside `folder`.
    pub fn diff_location(&self, folder: &Path, id: Uuid) -> PathBuf {
        folder.join(format!("{{{}}}.{}", id, self.diff_format))
    }

    #[instrument(skip(self))]
    pub async fn create_base(&self, location: &Path, id: Uuid, format: &str, size_mb: u64) -> Result<()> {
        let header = ImageHeader {
            id,
            format: format.to_string(),
            parent: None,
            logical_size_mb: size_mb,
            created_at: Utc::now(),
        };
        self.write_new(location, &header).await?;
        info!(location = %location.display(), medium_id = %id, size_mb, "base image created");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn create_diff(&self, location: &Path, id: Uuid, parent: Uuid, size_mb: u64) -> Result<()> {
        let header = ImageHeader {
            id,
            format: self.diff_format.clone(),
            parent: Some(parent),
            logical_size_mb: size_mb,
            created_at: Utc::now(),
        };
        self.write_new(location, &header).await?;
        info!(
            location = %location.display(),
            medium_id = %id,
            parent_id = %parent,
            "differencing image created"
        );
        Ok(())
    }

    /// Remove an image file. A file that is already gone is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, location: &Path) -> Result<()> {
        match tokio::fs::remove_file(location).await {
            Ok(()) => {
                info!(location = %location.display(), "image deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(location = %location.display(), "image already absent");
                Ok(())
            }
            Err(e) => Err(MachineError::io(
                format!("deleting image {}", location.display()),
                e,
            )),
        }
    }

    pub async fn read_header(&self, location: &Path) -> Result<ImageHeader> {
        let data = tokio::fs::read(location)
            .await
            .map_err(|e| MachineError::io(format!("reading image {}", location.display()), e))?;
        serde_json::from_slice(&data).map_err(|e| {
            MachineError::InvalidArgument(format!(
                "{} is not a valid image: {}",
                location.display(),
                e
            ))
        })
    }

    pub async fn exists(&self, location: &Path) -> bool {
        tokio::fs::metadata(location).await.is_ok()
    }

    async fn write_new(&self, location: &Path, header: &ImageHeader) -> Result<()> {
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| MachineError::io(format!("creating folder {}", parent.display()), e))?;
        }
        let data = serde_json::to_vec_pretty(header)
            .map_err(|e| MachineError::Internal(format!("serializing image header: {}", e)))?;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(location)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    MachineError::ObjectInUse(format!("image {} already exists", location.display()))
                } else {
                    MachineError::io(format!("creating image {}", location.display()), e)
                }
            })?;
        use tokio::io::AsyncWriteExt;
        file.write_all(&data)
            .await
            .map_err(|e| MachineError::io(format!("writing image {}", location.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| MachineError::io(format!("syncing image {}", location.display()), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new("vdi");
        let base = dir.path().join("base.vdi");
        let base_id = Uuid::new_v4();
        store.create_base(&base, base_id, "vdi", 1024).await.unwrap();

        let diff_id = Uuid::new_v4();
        let diff = store.diff_location(&dir.path().join("Snapshots"), diff_id);
        store.create_diff(&diff, diff_id, base_id, 1024).await.unwrap();

        let header = store.read_header(&diff).await.unwrap();
        assert_eq!(header.parent, Some(base_id));
        assert_eq!(header.format, "vdi");
        assert!(diff.to_string_lossy().ends_with(&format!("{{{}}}.vdi", diff_id)));

        store.delete(&diff).await.unwrap();
        assert!(!store.exists(&diff).await);
        // Deleting twice is fine.
        store.delete(&diff).await.unwrap();
    }

    #[tokio::test]
    async fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new("vdi");
        let path = dir.path().join("disk.vdi");
        store.create_base(&path, Uuid::new_v4(), "vdi", 16).await.unwrap();
        let err = store.create_base(&path, Uuid::new_v4(), "vdi", 16).await.unwrap_err();
        assert!(err.is_in_use());
    }

    #[tokio::test]
    async fn create_fails_when_folder_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("Snapshots");
        std::fs::write(&blocker, b"not a folder").unwrap();
        let store = ImageStore::new("vdi");
        let id = Uuid::new_v4();
        let err = store
            .create_diff(&store.diff_location(&blocker, id), id, Uuid::new_v4(), 16)
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Io { .. }));
    }
}
