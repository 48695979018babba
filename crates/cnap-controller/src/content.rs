//! Out-of-band storage for message bodies.
//!
//! The repository only keeps a pointer (`file_path`) per conversation row; the
//! message itself is written here first.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cnap_core::{ChatMessage, TaskId};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::ContentError;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a message body and return its location.
    async fn put(&self, task_id: &TaskId, message: &ChatMessage) -> Result<String, ContentError>;

    /// Load a message body previously returned by [`put`](Self::put).
    async fn get(&self, location: &str) -> Result<ChatMessage, ContentError>;
}

/// Stores each message as `{root}/{task_id}/{uuid}.json`.
#[derive(Debug, Clone)]
pub struct FileContentStore {
    root: PathBuf,
}

impl FileContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/{task_id}`; the ID must be exactly one normal path component.
    fn task_dir(&self, task_id: &TaskId) -> Result<PathBuf, ContentError> {
        let mut components = Path::new(task_id.as_str()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(ContentError::InvalidTaskDir(task_id.clone())),
        }
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn put(&self, task_id: &TaskId, message: &ChatMessage) -> Result<String, ContentError> {
        let dir = self.task_dir(task_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ContentError::Io {
                path: dir.clone(),
                source,
            })?;

        let path = dir.join(format!("{}.json", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(message)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|source| ContentError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(task_id = %task_id, path = %path.display(), "Message content written");
        Ok(path.to_string_lossy().into_owned())
    }

    async fn get(&self, location: &str) -> Result<ChatMessage, ContentError> {
        let path = PathBuf::from(location);
        let body = tokio::fs::read(&path)
            .await
            .map_err(|source| ContentError::Io {
                path: path.clone(),
                source,
            })?;
        serde_json::from_slice(&body).map_err(|source| ContentError::Decode { path, source })
    }
}

/// Keeps message bodies in memory, keyed by `mem://{task_id}/{uuid}`.
#[derive(Default)]
pub struct InMemoryContentStore {
    blobs: RwLock<HashMap<String, ChatMessage>>,
}

impl InMemoryContentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put(&self, task_id: &TaskId, message: &ChatMessage) -> Result<String, ContentError> {
        let location = format!("mem://{task_id}/{}", Uuid::new_v4());
        self.blobs
            .write()
            .await
            .insert(location.clone(), message.clone());
        Ok(location)
    }

    async fn get(&self, location: &str) -> Result<ChatMessage, ContentError> {
        self.blobs
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| ContentError::Io {
                path: PathBuf::from(location),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_layout_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(dir.path());
        let task_id = TaskId::new("t1");

        let location = store
            .put(&task_id, &ChatMessage::user("hello"))
            .await
            .unwrap();
        let path = PathBuf::from(&location);
        assert_eq!(path.parent().unwrap(), dir.path().join("t1"));
        assert_eq!(path.extension().unwrap(), "json");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["role"], "user");
        assert_eq!(raw["content"], "hello");

        assert_eq!(store.get(&location).await.unwrap(), ChatMessage::user("hello"));
    }

    #[tokio::test]
    async fn test_file_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(dir.path());

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            store.get(&missing.to_string_lossy()).await,
            Err(ContentError::Io { .. })
        ));

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"{ not json").unwrap();
        assert!(matches!(
            store.get(&corrupt.to_string_lossy()).await,
            Err(ContentError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_stays_under_root() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("data");
        let store = FileContentStore::new(&root);

        for id in ["../escaped", "a/b", "..", "/abs"] {
            assert!(
                matches!(
                    store.put(&TaskId::new(id), &ChatMessage::user("x")).await,
                    Err(ContentError::InvalidTaskDir(_))
                ),
                "{id:?} should be rejected"
            );
        }
        assert!(!parent.path().join("escaped").exists());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = InMemoryContentStore::new();
        let location = store
            .put(&TaskId::new("t1"), &ChatMessage::assistant("hi"))
            .await
            .unwrap();
        assert!(location.starts_with("mem://t1/"));
        assert_eq!(store.get(&location).await.unwrap(), ChatMessage::assistant("hi"));
        assert!(store.get("mem://t1/missing").await.is_err());
    }
}
