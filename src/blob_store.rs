// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Blob storage backend.
//!
//! Blobs are content-addressed: the key is the lowercase hex SHA-256 of the
//! bytes. The node only needs a handful of operations from the backend, so
//! the [`BlobStore`] trait keeps the seam small enough to swap the
//! filesystem for an object store.
//!
//! ```text
//! <blob_dir>/
//! ├── 3a/
//! │   └── 3a7bd3e2360a3d29eea436fcfb7e44c735d117c42d1c1835420b6b9942dd4f1b
//! └── fc/
//!     └── fcde2b2edba56bf408601fb721fe9b5c338d10ee429ea04fae5511b68fbf8fb9
//! ```

use crate::error::{BoxFuture, ReplicationError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content key for a byte string: hex SHA-256.
pub fn content_key(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A valid key is exactly 64 lowercase hex characters.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Check that `data` hashes to `key`.
pub fn verify_content(key: &str, data: &[u8]) -> bool {
    content_key(data) == key
}

fn check_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(ReplicationError::Blob(format!("invalid blob key {:?}", key)))
    }
}

/// What the node needs from blob storage.
pub trait BlobStore: Send + Sync + 'static {
    /// Store bytes under `key`. Overwrites are harmless (same content).
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> BoxFuture<'a, ()>;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Bytes>>;

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;

    /// Returns `false` if the blob was not present.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool>;

    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<u64>>;

    /// Up to `limit` stored keys strictly after `after`, ascending.
    fn keys_after<'a>(&'a self, after: Option<&'a str>, limit: usize) -> BoxFuture<'a, Vec<String>>;
}

// =============================================================================
// Filesystem
// =============================================================================

/// Blobs as files under a root directory, sharded by the first key byte.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            ReplicationError::Config(format!("Cannot create blob dir {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(key)
    }
}

fn io_err(action: &str, key: &str, e: std::io::Error) -> ReplicationError {
    ReplicationError::Blob(format!("{} {}: {}", action, key, e))
}

impl BlobStore for FsBlobStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            check_key(key)?;
            let path = self.path_for(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_err("create dir for", key, e))?;
            }
            // Write-then-rename so readers never see a partial blob
            let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
            let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), seq));
            tokio::fs::write(&tmp, &data)
                .await
                .map_err(|e| io_err("write", key, e))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| io_err("rename", key, e))?;
            debug!(key, size = data.len(), "Blob written");
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            check_key(key)?;
            match tokio::fs::read(self.path_for(key)).await {
                Ok(data) => Ok(Some(Bytes::from(data))),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err("read", key, e)),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            check_key(key)?;
            tokio::fs::try_exists(self.path_for(key))
                .await
                .map_err(|e| io_err("stat", key, e))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            check_key(key)?;
            match tokio::fs::remove_file(self.path_for(key)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
                Err(e) => Err(io_err("delete", key, e)),
            }
        })
    }

    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move {
            check_key(key)?;
            match tokio::fs::metadata(self.path_for(key)).await {
                Ok(meta) => Ok(Some(meta.len())),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(io_err("stat", key, e)),
            }
        })
    }

    fn keys_after<'a>(&'a self, after: Option<&'a str>, limit: usize) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            if limit == 0 {
                return Ok(keys);
            }
            // Shards sort like their keys, so only shards at or past the
            // cursor's prefix are read, and listing stops once a page is full
            let first_shard = after.map(|a| a.get(..2).unwrap_or(a)).unwrap_or("");
            let mut shards = Vec::new();
            let mut dir = match tokio::fs::read_dir(&self.root).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
                Err(e) => return Err(io_err("list", "root", e)),
            };
            while let Some(shard) = dir.next_entry().await.map_err(|e| io_err("list", "root", e))? {
                let is_dir = shard.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if let Some(name) = shard.file_name().to_str() {
                    if is_dir && name.len() == 2 && name >= first_shard {
                        shards.push((name.to_string(), shard.path()));
                    }
                }
            }
            shards.sort();

            for (_, path) in shards {
                let mut shard_keys = Vec::new();
                let mut entries = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| io_err("list", "shard", e))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| io_err("list", "shard", e))?
                {
                    if let Some(name) = entry.file_name().to_str() {
                        if is_valid_key(name) && after.map_or(true, |a| name > a) {
                            shard_keys.push(name.to_string());
                        }
                    }
                }
                shard_keys.sort();
                keys.extend(shard_keys);
                if keys.len() >= limit {
                    break;
                }
            }
            keys.truncate(limit);
            Ok(keys)
        })
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Blobs held in a map. Used by tests and single-process demos.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put<'a>(&'a self, key: &'a str, data: Bytes) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            check_key(key)?;
            self.blobs.write().insert(key.to_string(), data);
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<Bytes>> {
        Box::pin(async move { Ok(self.blobs.read().get(key).cloned()) })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.blobs.read().contains_key(key)) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.blobs.write().remove(key).is_some()) })
    }

    fn size<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<u64>> {
        Box::pin(async move { Ok(self.blobs.read().get(key).map(|b| b.len() as u64)) })
    }

    fn keys_after<'a>(&'a self, after: Option<&'a str>, limit: usize) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let blobs = self.blobs.read();
            let range = match after {
                Some(a) => blobs.range::<str, _>((Bound::Excluded(a), Bound::Unbounded)),
                None => blobs.range::<str, _>(..),
            };
            Ok(range.take(limit).map(|(k, _)| k.clone()).collect())
        })
    }
}
