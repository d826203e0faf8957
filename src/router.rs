use std::sync::{
    OnceLock,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use regex::Regex;
use url::Url;

use crate::{
    resource_store::ResourceStore,
    session::{NewResource, ResourceId, ResourceMeta, ResourcePayload, SessionId, is_html},
    storage::StoreError,
};

pub const DEFAULT_LARGE_OBJECT_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;
const MAX_KEY_SEGMENT_LEN: usize = 96;
const FALLBACK_KEY_SEGMENT: &str = "resource";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingPolicy {
    /// Payloads strictly larger than this go to blob storage.
    pub large_object_threshold_bytes: u64,
    /// Running cap on inline bytes per session; `None`, the default, disables it.
    pub max_inline_bytes_per_session: Option<u64>,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            large_object_threshold_bytes: DEFAULT_LARGE_OBJECT_THRESHOLD_BYTES,
            max_inline_bytes_per_session: None,
        }
    }
}

/// The session a router appends to, and the URL whose HTML is the main document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub id: SessionId,
    pub target_url: Url,
}

impl SessionTarget {
    pub fn is_main_document(&self, url: &str, content_type: &str) -> bool {
        url == self.target_url.as_str() && is_html(content_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    MainDocument,
    Inline,
    LargeObject,
    InlineCapExceeded,
}

impl Placement {
    pub fn is_inline(self) -> bool {
        matches!(self, Self::MainDocument | Self::Inline)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MainDocument => "main_document",
            Self::Inline => "inline",
            Self::LargeObject => "large_object",
            Self::InlineCapExceeded => "inline_cap_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedResource {
    pub id: ResourceId,
    pub placement: Placement,
    pub resource: NewResource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    Blob { url: String, source: StoreError },
    Document { url: String, source: StoreError },
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob { url, source } => write!(f, "store blob for {url}: {source}"),
            Self::Document { url, source } => write!(f, "append resource {url}: {source}"),
        }
    }
}

impl std::error::Error for RouteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Blob { source, .. } | Self::Document { source, .. } => Some(source),
        }
    }
}

/// Decides where each captured payload of one session is stored and appends it.
#[derive(Debug)]
pub struct StorageRouter {
    target: SessionTarget,
    policy: RoutingPolicy,
    store: ResourceStore,
    inline_bytes: AtomicU64,
    key_sequence: AtomicU64,
}

impl StorageRouter {
    pub fn new(target: SessionTarget, policy: RoutingPolicy, store: ResourceStore) -> Self {
        Self {
            target,
            policy,
            store,
            inline_bytes: AtomicU64::new(0),
            key_sequence: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn inline_bytes(&self) -> u64 {
        self.inline_bytes.load(Ordering::Relaxed)
    }

    /// Places the payload and appends the record to the session.
    ///
    /// A blob written for a record that then fails to append is deleted again.
    pub async fn route(
        &self,
        meta: ResourceMeta,
        payload: Bytes,
    ) -> Result<PersistedResource, RouteError> {
        let (placement, resource) = self.place(meta, payload).await?;
        match self
            .store
            .sessions()
            .append_resource(&self.target.id, resource.clone())
            .await
        {
            Ok(id) => {
                tracing::debug!(
                    session_id = %self.target.id,
                    resource_id = %id,
                    url = %resource.meta.url,
                    placement = placement.as_str(),
                    size_bytes = resource.payload.size_bytes(),
                    "stored resource"
                );
                Ok(PersistedResource {
                    id,
                    placement,
                    resource,
                })
            }
            Err(source) => {
                match &resource.payload {
                    ResourcePayload::Blob { key, .. } => {
                        if let Err(err) = self.store.blobs().delete(key).await {
                            tracing::warn!(
                                session_id = %self.target.id,
                                key = %key,
                                "failed to remove blob of unappended resource: {err}"
                            );
                        }
                    }
                    ResourcePayload::Inline(bytes) => {
                        self.inline_bytes
                            .fetch_sub(bytes.len() as u64, Ordering::Relaxed);
                    }
                }
                Err(RouteError::Document {
                    url: resource.meta.url,
                    source,
                })
            }
        }
    }

    /// Decides the payload location and writes the blob when needed, without appending.
    pub async fn place(
        &self,
        meta: ResourceMeta,
        payload: Bytes,
    ) -> Result<(Placement, NewResource), RouteError> {
        let size_bytes = payload.len() as u64;
        let placement = self.decide(&meta, size_bytes);

        let payload = if placement.is_inline() {
            ResourcePayload::Inline(payload)
        } else {
            let key = self.blob_key(&meta);
            if let Err(source) = self
                .store
                .blobs()
                .put(&key, payload, &meta.content_type)
                .await
            {
                return Err(RouteError::Blob {
                    url: meta.url,
                    source,
                });
            }
            ResourcePayload::Blob { key, size_bytes }
        };

        Ok((placement, NewResource { meta, payload }))
    }

    /// Inline placements are reserved against the per-session cap as they are decided.
    fn decide(&self, meta: &ResourceMeta, size_bytes: u64) -> Placement {
        if self.target.is_main_document(&meta.url, &meta.content_type) {
            self.inline_bytes.fetch_add(size_bytes, Ordering::Relaxed);
            return Placement::MainDocument;
        }
        if size_bytes > self.policy.large_object_threshold_bytes {
            return Placement::LargeObject;
        }
        if self.reserve_inline(size_bytes) {
            Placement::Inline
        } else {
            Placement::InlineCapExceeded
        }
    }

    fn reserve_inline(&self, size_bytes: u64) -> bool {
        let Some(cap) = self.policy.max_inline_bytes_per_session else {
            self.inline_bytes.fetch_add(size_bytes, Ordering::Relaxed);
            return true;
        };
        self.inline_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size_bytes)?;
                (next <= cap).then_some(next)
            })
            .is_ok()
    }

    fn blob_key(&self, meta: &ResourceMeta) -> String {
        let sequence = self.key_sequence.fetch_add(1, Ordering::Relaxed);
        format!(
            "sessions/{}/resources/{}-{sequence}-{}",
            self.target.id,
            meta.captured_at_unix_ms,
            trailing_segment(&meta.url)
        )
    }
}

fn unsafe_key_chars_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("key segment regex should compile"))
}

/// Last path segment of the URL, reduced to characters safe in a blob key.
fn trailing_segment(url: &str) -> String {
    let raw = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_owned))
            .unwrap_or_default(),
        Err(_) => {
            let without_query = url.split(['?', '#']).next().unwrap_or_default();
            without_query.rsplit('/').next().unwrap_or_default().to_owned()
        }
    };

    let sanitized = unsafe_key_chars_regex().replace_all(&raw, "_");
    let truncated: String = sanitized.chars().take(MAX_KEY_SEGMENT_LEN).collect();
    if truncated.trim_matches(['.', '_']).is_empty() {
        FALLBACK_KEY_SEGMENT.to_owned()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use url::Url;

    use super::{
        Placement, RouteError, RoutingPolicy, SessionTarget, StorageRouter, trailing_segment,
    };
    use crate::{
        blob::{BlobStore, FsBlobStore},
        resource_store::ResourceStore,
        session::{NewSession, ResourceMeta, ResourcePayload, SessionId},
        storage::{SqliteSessionStore, StoreError},
    };

    const MIB: usize = 1024 * 1024;

    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(
            &self,
            key: &str,
            _bytes: Bytes,
            _content_type: &str,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend(format!("bucket unavailable for {key}")))
        }

        async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
            Err(StoreError::NotFound(key.to_owned()))
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn meta(url: &str, content_type: &str) -> ResourceMeta {
        ResourceMeta {
            url: url.to_owned(),
            status: 200,
            content_type: content_type.to_owned(),
            captured_at_unix_ms: 1_700_000_000_000,
        }
    }

    async fn router_with(
        dir: &std::path::Path,
        blobs: Arc<dyn BlobStore>,
        policy: RoutingPolicy,
    ) -> (StorageRouter, ResourceStore) {
        let sessions = Arc::new(SqliteSessionStore::open_in_dir(dir).unwrap());
        let store = ResourceStore::new(sessions, blobs);
        let id = SessionId::parse("router").unwrap();
        store
            .sessions()
            .create_session(NewSession {
                id: id.clone(),
                url: "https://example.test/".to_owned(),
                started_at_unix_ms: 1,
                resources: Vec::new(),
            })
            .await
            .unwrap();
        let target = SessionTarget {
            id,
            target_url: Url::parse("https://example.test/").unwrap(),
        };
        (StorageRouter::new(target, policy, store.clone()), store)
    }

    async fn fs_router(
        dir: &std::path::Path,
        policy: RoutingPolicy,
    ) -> (StorageRouter, ResourceStore) {
        let blobs = Arc::new(FsBlobStore::open_in_dir(dir).unwrap());
        router_with(dir, blobs, policy).await
    }

    #[tokio::test]
    async fn main_document_stays_inline_regardless_of_size() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RoutingPolicy {
            large_object_threshold_bytes: 10,
            max_inline_bytes_per_session: Some(10),
        };
        let (router, _store) = fs_router(dir.path(), policy).await;

        let persisted = router
            .route(
                meta("https://example.test/", "text/html; charset=utf-8"),
                Bytes::from(vec![b'a'; 64]),
            )
            .await
            .unwrap();
        assert_eq!(persisted.placement, Placement::MainDocument);
        assert!(persisted.resource.payload.is_inline());
    }

    #[tokio::test]
    async fn payload_at_threshold_is_inline_and_above_goes_to_blob() {
        let dir = tempfile::tempdir().unwrap();
        let (router, store) = fs_router(dir.path(), RoutingPolicy::default()).await;

        let at_threshold = router
            .route(
                meta("https://example.test/at.bin", "application/octet-stream"),
                Bytes::from(vec![0u8; 5 * MIB]),
            )
            .await
            .unwrap();
        assert_eq!(at_threshold.placement, Placement::Inline);

        let above = router
            .route(
                meta("https://example.test/assets/style.css?v=3", "text/css"),
                Bytes::from(vec![b' '; 5 * MIB + 1]),
            )
            .await
            .unwrap();
        assert_eq!(above.placement, Placement::LargeObject);
        let ResourcePayload::Blob { key, size_bytes } = &above.resource.payload else {
            panic!("expected blob payload, got {:?}", above.resource.payload);
        };
        assert_eq!(*size_bytes, (5 * MIB + 1) as u64);
        assert!(
            key.starts_with("sessions/router/resources/1700000000000-"),
            "key: {key}"
        );
        assert!(key.ends_with("-style.css"), "key: {key}");
        assert_eq!(store.blobs().get(key).await.unwrap().len(), 5 * MIB + 1);

        let stored = store.resource(&router.target().id, above.id).await.unwrap();
        assert!(!stored.payload.is_inline());
    }

    #[tokio::test]
    async fn same_url_twice_yields_independent_records_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RoutingPolicy {
            large_object_threshold_bytes: 1,
            max_inline_bytes_per_session: None,
        };
        let (router, store) = fs_router(dir.path(), policy).await;

        let first = router
            .route(meta("https://example.test/a.png", "image/png"), Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = router
            .route(meta("https://example.test/a.png", "image/png"), Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(
            first.resource.payload.blob_key(),
            second.resource.payload.blob_key()
        );
        assert_eq!(
            store.sessions().resource_count(&router.target().id).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn default_policy_keeps_every_sub_threshold_resource_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (router, _store) = fs_router(dir.path(), RoutingPolicy::default()).await;

        for n in 0..5 {
            let persisted = router
                .route(
                    meta(&format!("https://example.test/chunk-{n}.bin"), "application/wasm"),
                    Bytes::from(vec![n as u8; 4 * MIB]),
                )
                .await
                .unwrap();
            assert_eq!(persisted.placement, Placement::Inline, "resource {n}");
        }
        assert_eq!(router.inline_bytes(), (20 * MIB) as u64);
    }

    #[tokio::test]
    async fn inline_cap_spills_to_blob_storage() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RoutingPolicy {
            large_object_threshold_bytes: 100,
            max_inline_bytes_per_session: Some(150),
        };
        let (router, _store) = fs_router(dir.path(), policy).await;

        let script = |n: u8| meta(&format!("https://example.test/{n}.js"), "text/javascript");
        let first = router.route(script(1), Bytes::from(vec![1u8; 100])).await.unwrap();
        let second = router.route(script(2), Bytes::from(vec![2u8; 100])).await.unwrap();
        let third = router.route(script(3), Bytes::from(vec![3u8; 50])).await.unwrap();

        assert_eq!(first.placement, Placement::Inline);
        assert_eq!(second.placement, Placement::InlineCapExceeded);
        assert!(second.resource.payload.blob_key().is_some());
        assert_eq!(third.placement, Placement::Inline);
        assert_eq!(router.inline_bytes(), 150);
    }

    #[tokio::test]
    async fn blob_failure_drops_only_that_resource() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RoutingPolicy {
            large_object_threshold_bytes: 4,
            max_inline_bytes_per_session: None,
        };
        let (router, store) = router_with(dir.path(), Arc::new(FailingBlobStore), policy).await;

        let err = router
            .route(
                meta("https://example.test/big.mp4", "video/mp4"),
                Bytes::from_static(b"too large"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Blob { .. }), "error: {err}");
        assert!(err.to_string().contains("https://example.test/big.mp4"));

        router
            .route(
                meta("https://example.test/ok.txt", "text/plain"),
                Bytes::from_static(b"ok"),
            )
            .await
            .unwrap();
        assert_eq!(
            store.sessions().resource_count(&router.target().id).await.unwrap(),
            1
        );
    }

    #[test]
    fn trailing_segment_is_sanitized() {
        assert_eq!(trailing_segment("https://example.test/a/b/main.js?x=1"), "main.js");
        assert_eq!(trailing_segment("https://example.test/"), "resource");
        assert_eq!(
            trailing_segment("https://example.test/fonts/My%20Font.woff2"),
            "My_20Font.woff2"
        );
        assert_eq!(trailing_segment("not a url/../weird name"), "weird_name");
        assert_eq!(
            trailing_segment(&format!("https://example.test/{}", "a".repeat(200))).len(),
            96
        );
    }
}
