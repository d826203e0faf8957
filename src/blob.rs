use std::{
    fs,
    io::Write as _,
    path::{Component, Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;

use crate::storage::StoreError;

pub const BLOBS_DIRNAME: &str = "blobs";

/// Key-addressed object storage for payloads too large to keep inline.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Deleting a key that does not exist succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Stores each blob as a file below a root directory, with the key as relative path.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FsBlobStore {
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("create blob dir {}", root.display()))?;
        Ok(Self {
            root,
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn open_in_dir(storage_dir: &Path) -> anyhow::Result<Self> {
        Self::open(storage_dir.join(BLOBS_DIRNAME))
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_blob_key(key)?;
        Ok(self.root.join(key))
    }
}

fn validate_blob_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Backend("blob key cannot be empty".to_owned()));
    }
    if key.contains('\\') || key.split('/').any(str::is_empty) {
        return Err(StoreError::Backend(format!(
            "blob key `{key}` has empty or backslash-separated components"
        )));
    }
    let all_normal = key.split('/').all(|segment| segment != "." && segment != "..")
        && Path::new(key)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !all_normal {
        return Err(StoreError::Backend(format!(
            "blob key `{key}` must be a relative path without `.` or `..`"
        )));
    }
    Ok(())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for_key(key)?;
        let temp_suffix = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let key_owned = key.to_owned();
        tracing::debug!(
            key,
            content_type,
            size_bytes = bytes.len(),
            "writing blob"
        );
        tokio::task::spawn_blocking(move || write_blob_blocking(&path, &bytes, temp_suffix))
            .await
            .map_err(|err| {
                StoreError::Backend(format!("join blob write task for `{key_owned}`: {err}"))
            })?
            .map_err(|err| StoreError::Backend(format!("write blob `{key_owned}`: {err:#}")))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path_for_key(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("blob `{key}`")))
            }
            Err(err) => Err(StoreError::Backend(format!("read blob `{key}`: {err}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for_key(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Backend(format!("delete blob `{key}`: {err}"))),
        }
    }
}

fn write_blob_blocking(path: &Path, bytes: &[u8], temp_suffix: u64) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("blob path {} has no parent", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("blob");
    let temp_path = parent.join(format!(".{file_name}.{}.{temp_suffix}.tmp", std::process::id()));
    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("create {}", temp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("write {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("rename into {}", path.display()));
    }
    Ok(())
}
