//! Index writer - serialization, content addressing, and storage
//!
//! Handles writing index nodes to storage with content-addressed names.

use crate::error::{IndexerError, Result};
use strata_db_core::{ContentAddressedWrite, ContentKind};

/// Index writer for persisting nodes to storage
pub struct IndexWriter<'a, S> {
    storage: &'a S,
    alias: String,
    leaf_count: usize,
    branch_count: usize,
    total_bytes: usize,
}

impl<'a, S: ContentAddressedWrite> IndexWriter<'a, S> {
    pub fn new(storage: &'a S, alias: impl Into<String>) -> Self {
        Self {
            storage,
            alias: alias.into(),
            leaf_count: 0,
            branch_count: 0,
            total_bytes: 0,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn branch_count(&self) -> usize {
        self.branch_count
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Reset counts (for per-ordering tracking)
    pub fn reset_counts(&mut self) {
        self.leaf_count = 0;
        self.branch_count = 0;
    }

    async fn write(&mut self, kind: ContentKind, bytes: &[u8]) -> Result<String> {
        let res = self
            .storage
            .content_write_bytes(kind, &self.alias, bytes)
            .await
            .map_err(|e| IndexerError::StorageWrite(e.to_string()))?;
        self.total_bytes += bytes.len();
        Ok(res.address)
    }

    /// Write a leaf node and return its storage address
    pub async fn write_leaf(&mut self, bytes: &[u8]) -> Result<String> {
        let address = self.write(ContentKind::IndexLeaf, bytes).await?;
        self.leaf_count += 1;
        Ok(address)
    }

    /// Write a branch node and return its storage address
    pub async fn write_branch(&mut self, bytes: &[u8]) -> Result<String> {
        let address = self.write(ContentKind::IndexBranch, bytes).await?;
        self.branch_count += 1;
        Ok(address)
    }

    /// Write the root record and return its storage address
    pub async fn write_root(&mut self, bytes: &[u8]) -> Result<String> {
        self.write(ContentKind::IndexRoot, bytes).await
    }

    /// Write a garbage record and return its storage address
    pub async fn write_garbage(&mut self, bytes: &[u8]) -> Result<String> {
        self.write(ContentKind::GarbageRecord, bytes).await
    }
}
