//! External resources touched by tools, and ordered access to them.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::agent_loop::ledger::TurnWaiter;
use crate::error::WeftError;

/// Backing store for resource-keyed tools.
///
/// The execution core only needs "read current state" and "apply mutation"
/// as two awaitable operations.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Current content of `key`, `None` if it does not exist.
    async fn read(&self, key: &str) -> Result<Option<String>, WeftError>;

    /// Replace the content of `key`.
    async fn write(&self, key: &str, content: &str) -> Result<(), WeftError>;

    /// Canonical spelling of `key`. Keys that name the same resource must
    /// normalize to the same string; calls are ordered on the result.
    fn normalize_key(&self, key: &str) -> Result<String, WeftError> {
        Ok(key.to_string())
    }
}

/// In-memory store keyed by the raw resource key.
#[derive(Debug, Default)]
pub struct MemoryResourceStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, key: impl Into<String>, content: impl Into<String>) {
        self.entries.write().await.insert(key.into(), content.into());
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn read(&self, key: &str) -> Result<Option<String>, WeftError> {
        Ok(self.get(key).await)
    }

    async fn write(&self, key: &str, content: &str) -> Result<(), WeftError> {
        self.insert(key, content).await;
        Ok(())
    }
}

/// Filesystem store rooted at a project directory.
///
/// Keys are paths relative to the root; a leading `/` is ignored and `..`
/// components are rejected.
#[derive(Debug, Clone)]
pub struct FsResourceStore {
    root: PathBuf,
}

impl FsResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, WeftError> {
        Ok(self.root.join(self.normalize_key(key)?))
    }
}

#[async_trait]
impl ResourceStore for FsResourceStore {
    /// `/a.txt`, `a.txt` and `./a.txt` all become `a.txt`.
    fn normalize_key(&self, key: &str) -> Result<String, WeftError> {
        let mut parts = Vec::new();
        for component in Path::new(key.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(WeftError::InvalidArgument(format!(
                        "path escapes project root: {key}"
                    )))
                }
            }
        }
        Ok(parts.join("/"))
    }

    async fn read(&self, key: &str) -> Result<Option<String>, WeftError> {
        let path = self.resolve(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, key: &str, content: &str) -> Result<(), WeftError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(())
    }
}

/// A handler's view of one resource, ordered against other calls on the
/// same key.
///
/// Both operations wait until every earlier call on the key has finished.
#[derive(Clone)]
pub struct ResourceSlot {
    key: String,
    waiter: TurnWaiter,
    store: Arc<dyn ResourceStore>,
}

impl ResourceSlot {
    pub(crate) fn new(key: String, waiter: TurnWaiter, store: Arc<dyn ResourceStore>) -> Self {
        Self { key, waiter, store }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current content of the resource, once this call's turn arrives.
    pub async fn current(&self) -> Result<Option<String>, WeftError> {
        self.waiter.wait().await?;
        self.store.read(&self.key).await
    }

    /// Apply a mutation, once this call's turn arrives.
    pub async fn commit(&self, content: &str) -> Result<(), WeftError> {
        self.waiter.wait().await?;
        self.store.write(&self.key, content).await
    }
}
