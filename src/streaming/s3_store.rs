//! S3 Object Store Implementation
//!
//! Provides an S3-compatible object store for production use.
//! Uses the `object_store` crate from the Arrow ecosystem; multipart uploads
//! go through its `MultipartStore` API so that part boundaries are exactly
//! the chunk boundaries chosen by the uploader.
//!
//! Supports:
//! - AWS S3
//! - S3-compatible services (MinIO, LocalStack, etc.)
//! - Custom endpoints
//!
//! S3 rejects parts smaller than 5MB except the last one. Chunks are cut on
//! compressed size and every finished chunk reaches the threshold, so a
//! `chunk_threshold_bytes` of at least 5MB keeps every part but the last
//! large enough.

use crate::streaming::config::S3Config;
use crate::streaming::object_store::{MultipartUpload, ObjectStore, PartTag, StoreFuture};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as ObjectStoreTrait, PutPayload};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// S3 Object Store for production deployments
///
/// Uses the `object_store` crate which provides:
/// - Standard S3 API support
/// - S3-compatible services (MinIO, LocalStack)
/// - Built-in retry logic
///
/// Generic over the backing client so tests can run against
/// `object_store::memory::InMemory`.
pub struct S3ObjectStore<T = AmazonS3>
where
    T: ObjectStoreTrait + MultipartStore,
{
    store: Arc<T>,
}

impl S3ObjectStore<AmazonS3> {
    /// Create a new S3 object store
    ///
    /// Configuration via environment variables:
    /// - AWS_ACCESS_KEY_ID
    /// - AWS_SECRET_ACCESS_KEY
    /// - AWS_REGION (or uses config.region)
    /// - AWS_ENDPOINT (or uses config.endpoint for MinIO)
    pub async fn new(config: S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        // Use custom endpoint for S3-compatible services (MinIO)
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store: Arc::new(store),
        })
    }
}

impl<T: ObjectStoreTrait + MultipartStore> S3ObjectStore<T> {
    /// Create from an existing client (for testing)
    pub fn from_store(store: Arc<T>) -> Self {
        S3ObjectStore { store }
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => {
                IoError::new(ErrorKind::NotFound, err.to_string())
            }
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::Precondition { .. } => {
                IoError::new(ErrorKind::InvalidInput, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl<T: ObjectStoreTrait + MultipartStore> Clone for S3ObjectStore<T> {
    fn clone(&self) -> Self {
        S3ObjectStore {
            store: self.store.clone(),
        }
    }
}

impl<T: ObjectStoreTrait + MultipartStore> std::fmt::Debug for S3ObjectStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl<T: ObjectStoreTrait + MultipartStore> ObjectStore for S3ObjectStore<T> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            ObjectStoreTrait::put(
                self.store.as_ref(),
                &path,
                PutPayload::from(bytes::Bytes::copy_from_slice(data)),
            )
            .await
            .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            let result = ObjectStoreTrait::get(self.store.as_ref(), &path)
                .await
                .map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            match ObjectStoreTrait::head(self.store.as_ref(), &path).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload> {
        Box::pin(async move {
            let path = ObjectPath::from(key);
            let upload_id = MultipartStore::create_multipart(self.store.as_ref(), &path)
                .await
                .map_err(Self::map_error)?;
            Ok(MultipartUpload {
                key: key.to_string(),
                upload_id,
            })
        })
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        part_index: usize,
        data: &'a [u8],
    ) -> StoreFuture<'a, PartTag> {
        Box::pin(async move {
            let path = ObjectPath::from(upload.key.as_str());
            let part = MultipartStore::put_part(
                self.store.as_ref(),
                &path,
                &upload.upload_id,
                part_index,
                PutPayload::from(bytes::Bytes::copy_from_slice(data)),
            )
            .await
            .map_err(Self::map_error)?;
            Ok(PartTag {
                part_index,
                tag: part.content_id,
            })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = ObjectPath::from(upload.key.as_str());
            let part_ids = parts
                .iter()
                .map(|p| PartId {
                    content_id: p.tag.clone(),
                })
                .collect();
            MultipartStore::complete_multipart(
                self.store.as_ref(),
                &path,
                &upload.upload_id,
                part_ids,
            )
            .await
            .map_err(Self::map_error)?;
            Ok(())
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = ObjectPath::from(upload.key.as_str());
            let aborted =
                MultipartStore::abort_multipart(self.store.as_ref(), &path, &upload.upload_id).await;
            match aborted {
                Ok(()) => Ok(()),
                Err(object_store::Error::NotFound { .. }) => Ok(()), // Already gone
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn store() -> S3ObjectStore<InMemory> {
        S3ObjectStore::from_store(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn test_put_get_not_found() {
        let store = store();
        store.put("pfx/last_chunk_index.bar-00000.txt", b"idx").await.unwrap();
        assert_eq!(
            store.get("pfx/last_chunk_index.bar-00000.txt").await.unwrap(),
            b"idx"
        );

        let err = store.get("pfx/missing").await.unwrap_err();
        assert!(store.is_not_found(&err));
        assert!(!store.exists("pfx/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_multipart_round_trip() {
        let store = store();
        let upload = store.initiate_multipart("pfx/blob.gz").await.unwrap();
        let a = store.upload_part(&upload, 0, b"first|").await.unwrap();
        let b = store.upload_part(&upload, 1, b"second").await.unwrap();
        assert!(!store.exists("pfx/blob.gz").await.unwrap());

        store.complete_multipart(&upload, &[a, b]).await.unwrap();
        assert_eq!(store.get("pfx/blob.gz").await.unwrap(), b"first|second");
    }

    #[tokio::test]
    async fn test_abort_leaves_no_object() {
        let store = store();
        let upload = store.initiate_multipart("pfx/blob.gz").await.unwrap();
        store.upload_part(&upload, 0, b"data").await.unwrap();
        store.abort_multipart(&upload).await.unwrap();
        assert!(!store.exists("pfx/blob.gz").await.unwrap());
    }
}
