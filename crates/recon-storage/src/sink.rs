//! Object storage destination for comparison files.

use std::path::Path as FsPath;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub location: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("invalid object path {path}: {source}")]
    Path {
        path: String,
        #[source]
        source: object_store::path::Error,
    },
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, StorageError>;
}

/// Replaces `{timestamp}` in a destination template with `%Y%m%d_%H%M%S`.
pub fn render_destination_path(template: &str, executed_at: DateTime<Utc>) -> String {
    let stamp = executed_at.format("%Y%m%d_%H%M%S").to_string();
    template.replace("{timestamp}", &stamp)
}

fn parse_object_path(path: &str) -> Result<ObjectPath, StorageError> {
    ObjectPath::parse(path.trim_start_matches('/')).map_err(|source| StorageError::Path {
        path: path.to_string(),
        source,
    })
}

async fn put_bytes(
    store: &dyn ObjectStore,
    object_path: &ObjectPath,
    location: String,
    bytes: Vec<u8>,
) -> Result<StoredObject, StorageError> {
    let content_hash = sha256_hex(&bytes);
    let byte_size = bytes.len();
    store.put(object_path, PutPayload::from(bytes)).await?;
    info!(%location, byte_size, %content_hash, "uploaded comparison file");
    Ok(StoredObject {
        location,
        content_hash,
        byte_size,
    })
}

/// Amazon S3, configured from the standard `AWS_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct S3ResultSink;

#[async_trait]
impl ResultSink for S3ResultSink {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, StorageError> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?;
        let object_path = parse_object_path(path)?;
        let location = format!("s3://{bucket}/{object_path}");
        put_bytes(&store, &object_path, location, bytes).await
    }
}

/// Any single [`ObjectStore`]; the bucket becomes the leading path segment.
#[derive(Debug, Clone)]
pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    scheme: String,
}

impl ObjectStoreSink {
    pub fn new(store: Arc<dyn ObjectStore>, scheme: impl Into<String>) -> Self {
        Self {
            store,
            scheme: scheme.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    pub fn local(root: impl AsRef<FsPath>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|err| {
            StorageError::ObjectStore(object_store::Error::Generic {
                store: "LocalFileSystem",
                source: Box::new(err),
            })
        })?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store), format!("file://{}/", root.display())))
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    pub fn object_path(bucket: &str, path: &str) -> Result<ObjectPath, StorageError> {
        parse_object_path(&format!("{}/{}", bucket.trim_matches('/'), path.trim_start_matches('/')))
    }
}

#[async_trait]
impl ResultSink for ObjectStoreSink {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, StorageError> {
        let object_path = Self::object_path(bucket, path)?;
        let location = format!("{}{}", self.scheme, object_path);
        put_bytes(self.store.as_ref(), &object_path, location, bytes).await
    }
}
