//! One key space over the two backends: session records in the document store, large
//! payloads in the blob store.

use std::{path::Path, sync::Arc};

use bytes::Bytes;

use crate::{
    blob::{BlobStore, FsBlobStore},
    session::{Resource, ResourceId, ResourcePayload, SessionDetail, SessionId},
    storage::{SessionStore, SqliteSessionStore, StoreError},
};

#[derive(Clone)]
pub struct ResourceStore {
    sessions: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
}

impl std::fmt::Debug for ResourceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceStore").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedSession {
    pub session_id: SessionId,
    pub blobs_deleted: usize,
}

impl ResourceStore {
    pub fn new(sessions: Arc<dyn SessionStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { sessions, blobs }
    }

    /// Opens `sessions.db` and `blobs/` below `storage_dir`, creating both when missing.
    pub fn open_in_dir(storage_dir: &Path) -> anyhow::Result<Self> {
        let sessions = SqliteSessionStore::open_in_dir(storage_dir)?;
        let blobs = FsBlobStore::open_in_dir(storage_dir)?;
        Ok(Self::new(Arc::new(sessions), Arc::new(blobs)))
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn session(&self, id: &SessionId) -> Result<SessionDetail, StoreError> {
        self.sessions
            .get_session(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session `{id}`")))
    }

    pub async fn resource(
        &self,
        session: &SessionId,
        resource: ResourceId,
    ) -> Result<Resource, StoreError> {
        self.sessions
            .get_resource(session, resource)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("resource {resource} in session `{session}`"))
            })
    }

    /// Loads the payload bytes wherever they live.
    pub async fn load_payload(&self, resource: &Resource) -> Result<Bytes, StoreError> {
        match &resource.payload {
            ResourcePayload::Inline(bytes) => Ok(bytes.clone()),
            ResourcePayload::Blob { key, .. } => self.blobs.get(key).await,
        }
    }

    /// Deletes every blob-stored payload of the session, then the session record.
    ///
    /// A blob deletion failure aborts before the record is touched, so a retry can still
    /// find the remaining keys.
    pub async fn delete_session(&self, id: &SessionId) -> Result<DeletedSession, StoreError> {
        if self.sessions.get_session(id).await?.is_none() {
            return Err(StoreError::NotFound(format!("session `{id}`")));
        }

        let keys = self.sessions.blob_keys(id).await?;
        for key in &keys {
            self.blobs.delete(key).await.map_err(|err| {
                StoreError::Backend(format!("delete blob `{key}` of session `{id}`: {err}"))
            })?;
        }

        if !self.sessions.delete_session(id).await? {
            return Err(StoreError::NotFound(format!("session `{id}`")));
        }
        tracing::info!(session_id = %id, blobs_deleted = keys.len(), "deleted session");
        Ok(DeletedSession {
            session_id: id.clone(),
            blobs_deleted: keys.len(),
        })
    }
}
