//! Key/Value Store (spec §4.1).
//!
//! No teacher module covers embedded key/value persistence — `distribution`
//! persists through Postgres/SQLite. Enriched from the pack's `sled` usage
//! (seen across several `other_examples/manifests` Cargo.tomls) rather than
//! hand-rolling a file format: `sled` gives named trees, which map directly
//! onto the bucket/sub-bucket shape spec.md describes.
//!
//! The distinguished `"container"` bucket holds per-container configuration
//! and state under composite keys `"<container-name>\0<key>"`, so that
//! `remove_container` can delete an entire device's keys in one range scan
//! without a second level of tree nesting.

use crate::error::{CoreError, InternalError};
use async_trait::async_trait;
use std::path::Path;

const CONTAINER_BUCKET: &str = "container";
const SEP: u8 = 0;

/// A typed read miss (spec §4.1 "Failure semantics"): distinguishes a
/// bucket (or, for a container, its whole sub-bucket) that has never held
/// anything from one key missing within a bucket that exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvsMiss {
    Bucket,
    Key,
}

fn container_key(container_name: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(container_name.len() + 1 + key.len());
    out.extend_from_slice(container_name.as_bytes());
    out.push(SEP);
    out.extend_from_slice(key.as_bytes());
    out
}

#[async_trait]
pub trait Kvs: Send + Sync {
    /// Writes `value` under `key` in `bucket`, creating the bucket if absent.
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), CoreError>;

    /// Reads `key` from `bucket`. The inner `Result` carries a
    /// [`KvsMiss`] telling apart a bucket that has never existed from a
    /// key simply absent from an existing one (spec §4.1).
    async fn get(&self, bucket: &str, key: &str) -> Result<Result<Vec<u8>, KvsMiss>, CoreError>;

    /// Like [`Kvs::get`] but returns an empty vec on any miss, matching the
    /// places spec.md calls for a zero-value default instead of a typed
    /// miss (e.g. reading a container's stored cmdline before it is set).
    async fn get_or_empty(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        Ok(self.get(bucket, key).await?.unwrap_or_default())
    }

    /// Writes `value` under the composite key `"<container_name>\0<key>"` in
    /// the distinguished container bucket.
    async fn put_container(
        &self,
        container_name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), CoreError>;

    async fn get_container(
        &self,
        container_name: &str,
        key: &str,
    ) -> Result<Result<Vec<u8>, KvsMiss>, CoreError>;

    async fn get_container_or_empty(
        &self,
        container_name: &str,
        key: &str,
    ) -> Result<Vec<u8>, CoreError> {
        Ok(self
            .get_container(container_name, key)
            .await?
            .unwrap_or_default())
    }

    /// Deletes every key stored under `container_name` in the container
    /// bucket, atomically from the caller's point of view.
    async fn remove_container(&self, container_name: &str) -> Result<(), CoreError>;

    /// Flushes to disk and drops the handle. Safe to call more than once.
    async fn close(&self) -> Result<(), CoreError>;
}

pub struct SledKvs {
    db: sled::Db,
}

impl SledKvs {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InternalError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        Ok(SledKvs { db })
    }

    fn tree(&self, bucket: &str) -> Result<sled::Tree, CoreError> {
        self.db
            .open_tree(bucket)
            .map_err(|e| CoreError::KvsError(e.to_string()))
    }
}

#[async_trait]
impl Kvs for SledKvs {
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), CoreError> {
        let tree = self.tree(bucket)?;
        tree.insert(key.as_bytes(), value)
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Result<Vec<u8>, KvsMiss>, CoreError> {
        // `open_tree` auto-creates, so check existing tree names first to
        // tell a never-used bucket apart from an existing one missing `key`.
        let known = self
            .db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == bucket.as_bytes());
        if !known {
            return Ok(Err(KvsMiss::Bucket));
        }
        let tree = self.tree(bucket)?;
        let got = tree
            .get(key.as_bytes())
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        Ok(got.map(|ivec| ivec.to_vec()).ok_or(KvsMiss::Key))
    }

    async fn put_container(
        &self,
        container_name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<(), CoreError> {
        let tree = self.tree(CONTAINER_BUCKET)?;
        tree.insert(container_key(container_name, key), value)
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        Ok(())
    }

    async fn get_container(
        &self,
        container_name: &str,
        key: &str,
    ) -> Result<Result<Vec<u8>, KvsMiss>, CoreError> {
        let tree = self.tree(CONTAINER_BUCKET)?;
        let got = tree
            .get(container_key(container_name, key))
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        if let Some(ivec) = got {
            return Ok(Ok(ivec.to_vec()));
        }
        // The key itself is absent; tell apart a container with no keys at
        // all (its sub-bucket was never populated, or was removed) from one
        // that holds other keys but not this one.
        let mut prefix = container_name.as_bytes().to_vec();
        prefix.push(SEP);
        let has_any = tree
            .scan_prefix(&prefix)
            .next()
            .transpose()
            .map_err(|e| CoreError::KvsError(e.to_string()))?
            .is_some();
        Ok(Err(if has_any { KvsMiss::Key } else { KvsMiss::Bucket }))
    }

    async fn remove_container(&self, container_name: &str) -> Result<(), CoreError> {
        let tree = self.tree(CONTAINER_BUCKET)?;
        let mut prefix = container_name.as_bytes().to_vec();
        prefix.push(SEP);
        let keys: Vec<_> = tree
            .scan_prefix(&prefix)
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        for key in keys {
            tree.remove(key)
                .map_err(|e| CoreError::KvsError(e.to_string()))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.db
            .flush_async()
            .await
            .map_err(|e| CoreError::KvsError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_kvs() -> SledKvs {
        let dir = tempfile::tempdir().unwrap();
        SledKvs::open(dir.path().join("bolt.db")).unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let kvs = temp_kvs().await;
        kvs.put("devices", "pixel6", b"payload").await.unwrap();
        let got = kvs.get("devices", "pixel6").await.unwrap();
        assert_eq!(got, Ok(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_bucket_vs_missing_key() {
        let kvs = temp_kvs().await;
        assert_eq!(
            kvs.get("devices", "missing").await.unwrap(),
            Err(KvsMiss::Bucket)
        );
        kvs.put("devices", "pixel6", b"payload").await.unwrap();
        assert_eq!(
            kvs.get("devices", "missing").await.unwrap(),
            Err(KvsMiss::Key)
        );
        assert_eq!(
            kvs.get_or_empty("devices", "missing").await.unwrap(),
            Vec::<u8>::new()
        );
    }

    #[tokio::test]
    async fn container_keys_are_isolated_by_prefix() {
        let kvs = temp_kvs().await;
        kvs.put_container("cvd-a", "cmdline", b"-x").await.unwrap();
        kvs.put_container("cvd-ab", "cmdline", b"-y").await.unwrap();
        kvs.remove_container("cvd-a").await.unwrap();
        assert_eq!(
            kvs.get_container("cvd-a", "cmdline").await.unwrap(),
            Err(KvsMiss::Bucket)
        );
        assert_eq!(
            kvs.get_container("cvd-ab", "cmdline").await.unwrap(),
            Ok(b"-y".to_vec())
        );
    }

    #[tokio::test]
    async fn container_missing_key_vs_missing_bucket() {
        let kvs = temp_kvs().await;
        kvs.put_container("cvd-a", "cmdline", b"-x").await.unwrap();
        assert_eq!(
            kvs.get_container("cvd-a", "other-key").await.unwrap(),
            Err(KvsMiss::Key)
        );
        assert_eq!(
            kvs.get_container("cvd-never-created", "cmdline")
                .await
                .unwrap(),
            Err(KvsMiss::Bucket)
        );
    }
}
