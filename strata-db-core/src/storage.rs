//! Storage traits and backends.
//!
//! The engine reads and writes index data through three capability
//! traits, all runtime-agnostic via `async_trait`:
//!
//! - [`StorageRead`]: read, exists, list by prefix
//! - [`StorageWrite`]: write, idempotent delete
//! - [`ContentAddressedWrite`]: writes where storage derives the address
//!   from a SHA-256 content hash and owns the path layout
//!
//! [`Storage`] combines all three as a single bound. Backends here:
//! [`MemoryStorage`] always, [`FileStorage`] under the `native` feature.
//!
//! Storage failures are fatal. The engine propagates them unchanged and
//! never retries.

use crate::error::Result;
use async_trait::async_trait;
use sha2::Digest;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

/// Read-only storage operations.
#[async_trait]
pub trait StorageRead: Debug + Send + Sync {
    /// Read raw bytes. Addresses look like `strata:{method}://{path}`.
    ///
    /// Returns `Error::NotFound` when nothing is stored at the address.
    async fn read_bytes(&self, address: &str) -> Result<Vec<u8>>;

    async fn exists(&self, address: &str) -> Result<bool>;

    /// List all addresses under a prefix. Potentially expensive; used for
    /// admin operations and garbage collection, not queries.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Mutating storage operations.
#[async_trait]
pub trait StorageWrite: Debug + Send + Sync {
    /// Write bytes at an address. Content-addressed writes are naturally
    /// idempotent: rewriting identical content is a no-op.
    async fn write_bytes(&self, address: &str, bytes: &[u8]) -> Result<()>;

    /// Delete an object. Idempotent: deleting a missing object succeeds.
    async fn delete(&self, address: &str) -> Result<()>;
}

/// What a blob is, so the storage layout can partition it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContentKind {
    /// Commit record
    Commit,
    /// Index root record written by each index build
    IndexRoot,
    /// Branch node
    IndexBranch,
    /// Leaf node
    IndexLeaf,
    /// Garbage record listing a superseded root's nodes
    GarbageRecord,
}

/// Result of a content-addressed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentWriteResult {
    /// Canonical address to persist and reference.
    pub address: String,
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    pub size_bytes: usize,
}

/// Writes where storage chooses the address from the content hash.
#[async_trait]
pub trait ContentAddressedWrite: StorageWrite {
    /// Write with a caller-provided hex hash. Storage stays in charge of
    /// layout and returns the canonical address.
    async fn content_write_bytes_with_hash(
        &self,
        kind: ContentKind,
        alias: &str,
        content_hash_hex: &str,
        bytes: &[u8],
    ) -> Result<ContentWriteResult>;

    /// Write, hashing the content with SHA-256.
    async fn content_write_bytes(
        &self,
        kind: ContentKind,
        alias: &str,
        bytes: &[u8],
    ) -> Result<ContentWriteResult> {
        let hash_hex = sha256_hex(bytes);
        self.content_write_bytes_with_hash(kind, alias, &hash_hex, bytes)
            .await
    }
}

/// Full storage capability: read + write + content-addressed write.
pub trait Storage: StorageRead + ContentAddressedWrite {}
impl<T: StorageRead + ContentAddressedWrite> Storage for T {}

/// Hex SHA-256, the standard content hash for addressing.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Database alias to path prefix: `mydb:main` becomes `mydb/main`.
pub fn alias_prefix_for_path(alias: &str) -> String {
    alias.replace(':', "/")
}

/// Path layout for content-addressed data, partitioned by kind.
pub fn content_path(kind: ContentKind, alias: &str, hash_hex: &str) -> String {
    let prefix = alias_prefix_for_path(alias);
    match kind {
        ContentKind::Commit => format!("{}/commit/{}.json", prefix, hash_hex),
        ContentKind::IndexRoot => format!("{}/index/roots/{}.json", prefix, hash_hex),
        ContentKind::IndexBranch => format!("{}/index/branches/{}.json", prefix, hash_hex),
        ContentKind::IndexLeaf => format!("{}/index/leaves/{}.json", prefix, hash_hex),
        ContentKind::GarbageRecord => format!("{}/index/garbage/{}.json", prefix, hash_hex),
    }
}

/// Full address: `strata:{method}://{path}`.
pub fn content_address(method: &str, kind: ContentKind, alias: &str, hash_hex: &str) -> String {
    format!("strata:{}://{}", method, content_path(kind, alias, hash_hex))
}

/// Extract the content hash (filename stem) from an address like
/// `strata:file://mydb/main/index/leaves/abc123.json`.
pub fn extract_hash_from_address(address: &str) -> Option<String> {
    let filename = address.rsplit('/').next()?;
    let dot_pos = filename.rfind('.')?;
    if dot_pos == 0 {
        return None;
    }
    Some(filename[..dot_pos].to_string())
}

/// Decode JSON from stored bytes.
pub fn decode_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// In-memory storage backed by a shared map. The default for tests and
/// ephemeral databases.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Arc<RwLock<std::collections::HashMap<String, Vec<u8>>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(std::collections::HashMap::new())),
        }
    }

    /// Seed data directly, bypassing the address layout.
    pub fn insert(&self, address: impl Into<String>, data: Vec<u8>) {
        self.data
            .write()
            .expect("RwLock poisoned")
            .insert(address.into(), data);
    }

    pub fn insert_json<T: serde::Serialize>(
        &self,
        address: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.insert(address, bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.read().expect("RwLock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageRead for MemoryStorage {
    async fn read_bytes(&self, address: &str) -> Result<Vec<u8>> {
        self.data
            .read()
            .expect("RwLock poisoned")
            .get(address)
            .cloned()
            .ok_or_else(|| crate::error::Error::not_found(address))
    }

    async fn exists(&self, address: &str) -> Result<bool> {
        Ok(self
            .data
            .read()
            .expect("RwLock poisoned")
            .contains_key(address))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.read().expect("RwLock poisoned");
        Ok(data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StorageWrite for MemoryStorage {
    async fn write_bytes(&self, address: &str, bytes: &[u8]) -> Result<()> {
        self.data
            .write()
            .expect("RwLock poisoned")
            .insert(address.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, address: &str) -> Result<()> {
        self.data.write().expect("RwLock poisoned").remove(address);
        Ok(())
    }
}

#[async_trait]
impl ContentAddressedWrite for MemoryStorage {
    async fn content_write_bytes_with_hash(
        &self,
        kind: ContentKind,
        alias: &str,
        content_hash_hex: &str,
        bytes: &[u8],
    ) -> Result<ContentWriteResult> {
        let address = content_address("memory", kind, alias, content_hash_hex);
        self.write_bytes(&address, bytes).await?;
        Ok(ContentWriteResult {
            address,
            content_hash: content_hash_hex.to_string(),
            size_bytes: bytes.len(),
        })
    }
}

/// File-backed storage rooted at a base directory (native targets only).
#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: std::path::PathBuf,
}

#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
impl FileStorage {
    pub fn new(base_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &std::path::Path {
        &self.base_path
    }

    fn extract_path_from_address(address: &str) -> Option<&str> {
        if let Some(path) = address.strip_prefix("strata:file://") {
            return Some(path);
        }
        if address.starts_with("strata:") {
            if let Some(path_start) = address.find("://") {
                return Some(&address[path_start + 3..]);
            }
        }
        None
    }

    fn resolve_path(&self, address: &str) -> Result<std::path::PathBuf> {
        if let Some(path) = Self::extract_path_from_address(address) {
            return self.resolve_relative_path(path);
        }
        self.resolve_relative_path(&format!("{}.json", address))
    }

    fn resolve_relative_path(&self, path: &str) -> Result<std::path::PathBuf> {
        use std::path::Component;
        let p = std::path::Path::new(path);

        // No absolute paths, no traversal out of the base directory.
        if p.is_absolute()
            || p.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            })
        {
            return Err(crate::error::Error::storage(format!(
                "invalid storage path '{}': must be relative without '..'",
                path
            )));
        }

        Ok(self.base_path.join(p))
    }
}

#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
#[async_trait]
impl StorageRead for FileStorage {
    async fn read_bytes(&self, address: &str) -> Result<Vec<u8>> {
        let path = self.resolve_path(address)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                crate::error::Error::not_found(format!("{}: {}", address, path.display()))
            } else {
                crate::error::Error::io(format!("failed to read {}: {}", path.display(), e))
            }
        })
    }

    async fn exists(&self, address: &str) -> Result<bool> {
        let path = self.resolve_path(address)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(crate::error::Error::io(format!(
                "failed to stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let path_prefix = Self::extract_path_from_address(prefix).unwrap_or(prefix);
        let full_path = self.base_path.join(path_prefix);
        let list_dir = if full_path.is_dir() {
            full_path
        } else {
            full_path
                .parent()
                .unwrap_or(&self.base_path)
                .to_path_buf()
        };

        if !list_dir.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut dirs_to_visit = vec![list_dir];

        while let Some(dir) = dirs_to_visit.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(crate::error::Error::io(format!(
                        "failed to list {}: {}",
                        dir.display(),
                        e
                    )));
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                crate::error::Error::io(format!("failed to read entry in {}: {}", dir.display(), e))
            })? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| {
                    crate::error::Error::io(format!(
                        "failed to get file type for {}: {}",
                        path.display(),
                        e
                    ))
                })?;

                if file_type.is_dir() {
                    dirs_to_visit.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.base_path) {
                        let relative_str = relative.to_string_lossy().to_string();
                        if relative_str.starts_with(path_prefix) {
                            results.push(format!("strata:file://{}", relative_str));
                        }
                    }
                }
            }
        }

        Ok(results)
    }
}

#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
#[async_trait]
impl StorageWrite for FileStorage {
    async fn write_bytes(&self, address: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve_path(address)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                crate::error::Error::io(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tokio::fs::write(&path, bytes).await.map_err(|e| {
            crate::error::Error::io(format!("failed to write {}: {}", path.display(), e))
        })
    }

    async fn delete(&self, address: &str) -> Result<()> {
        let path = self.resolve_path(address)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(crate::error::Error::io(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[cfg(all(feature = "native", not(target_arch = "wasm32")))]
#[async_trait]
impl ContentAddressedWrite for FileStorage {
    async fn content_write_bytes_with_hash(
        &self,
        kind: ContentKind,
        alias: &str,
        content_hash_hex: &str,
        bytes: &[u8],
    ) -> Result<ContentWriteResult> {
        let address = content_address("file", kind, alias, content_hash_hex);
        self.write_bytes(&address, bytes).await?;
        Ok(ContentWriteResult {
            address,
            content_hash: content_hash_hex.to_string(),
            size_bytes: bytes.len(),
        })
    }
}
