//! Object Store Abstraction
//!
//! Provides a trait-based abstraction for the object storage operations the
//! sink needs: simple puts and gets for pointers and a multipart protocol for
//! data and index artifacts.
//!
//! Implementations:
//! - `InMemoryObjectStore`: For unit tests and DST
//! - `LocalFsObjectStore`: For development and local testing
//! - `S3ObjectStore`: For production (feature-gated)
//! - `SimulatedObjectStore`: Fault injection wrapper for DST

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Boxed future returned by store operations
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Shared, type-erased store handle
pub type DynObjectStore = Arc<dyn ObjectStore>;

/// An in-progress multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartUpload {
    /// Object key the upload will create
    pub key: String,
    /// Store-assigned upload identifier
    pub upload_id: String,
}

/// Receipt for one uploaded part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTag {
    /// Zero-based part position
    pub part_index: usize,
    /// Store-assigned tag (ETag or checksum)
    pub tag: String,
}

/// Object store abstraction trait
///
/// Errors are reported as `std::io::Error`. Whether an error means "key does
/// not exist" is decided by `is_not_found`, so provider-specific codes never
/// leak into callers.
pub trait ObjectStore: Send + Sync + 'static {
    /// Put an object (create or overwrite)
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()>;

    /// Get an object's contents
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>>;

    /// Check if an object exists
    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

    /// Begin a multipart upload for `key`
    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload>;

    /// Upload one part. Parts are numbered from zero.
    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        part_index: usize,
        data: &'a [u8],
    ) -> StoreFuture<'a, PartTag>;

    /// Assemble the uploaded parts, in the given order, into the final object
    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()>;

    /// Discard an upload and any parts stored for it
    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()>;

    /// Whether `err` means the requested key does not exist
    fn is_not_found(&self, err: &IoError) -> bool {
        err.kind() == ErrorKind::NotFound
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        (**self).put(key, data)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        (**self).get(key)
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        (**self).exists(key)
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload> {
        (**self).initiate_multipart(key)
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        part_index: usize,
        data: &'a [u8],
    ) -> StoreFuture<'a, PartTag> {
        (**self).upload_part(upload, part_index, data)
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()> {
        (**self).complete_multipart(upload, parts)
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()> {
        (**self).abort_multipart(upload)
    }

    fn is_not_found(&self, err: &IoError) -> bool {
        (**self).is_not_found(err)
    }
}

/// Checksum tag for a part body
fn part_checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Check a completion request against the parts the store holds.
/// Parts must be listed in order, start at zero, and carry matching tags.
fn check_completion(
    upload: &MultipartUpload,
    stored: &BTreeMap<usize, Bytes>,
    parts: &[PartTag],
) -> IoResult<()> {
    if parts.is_empty() {
        return Err(IoError::new(
            ErrorKind::InvalidInput,
            format!("Upload {} completed with no parts", upload.upload_id),
        ));
    }
    for (position, part) in parts.iter().enumerate() {
        if part.part_index != position {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!(
                    "Upload {} part {} listed at position {}",
                    upload.upload_id, part.part_index, position
                ),
            ));
        }
        let data = stored.get(&part.part_index).ok_or_else(|| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Upload {} is missing part {}", upload.upload_id, part.part_index),
            )
        })?;
        if part_checksum(data) != part.tag {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Upload {} part {} tag mismatch",
                    upload.upload_id, part.part_index
                ),
            ));
        }
    }
    Ok(())
}

fn no_such_upload(upload: &MultipartUpload) -> IoError {
    IoError::new(
        ErrorKind::NotFound,
        format!("No such upload: {} ({})", upload.upload_id, upload.key),
    )
}

// ============================================================================
// InMemoryObjectStore - For tests and DST
// ============================================================================

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<usize, Bytes>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
}

/// In-memory object store for unit tests and deterministic simulation
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<RwLock<InMemoryState>>,
    next_upload_id: Arc<AtomicU64>,
}

impl InMemoryObjectStore {
    /// Create a new in-memory object store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.state.read().objects.is_empty()
    }

    /// Sorted list of stored keys (for testing)
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state.read().uploads.len()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .write()
                .objects
                .insert(key.to_string(), Bytes::copy_from_slice(data));
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.state
                .read()
                .objects
                .get(key)
                .map(|data| data.to_vec())
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.state.read().objects.contains_key(key)) })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload> {
        Box::pin(async move {
            let id = self.next_upload_id.fetch_add(1, Ordering::SeqCst);
            let upload = MultipartUpload {
                key: key.to_string(),
                upload_id: format!("upload-{:08}", id),
            };
            self.state.write().uploads.insert(
                upload.upload_id.clone(),
                PendingUpload {
                    key: key.to_string(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload)
        })
    }

    fn upload_part<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        part_index: usize,
        data: &'a [u8],
    ) -> StoreFuture<'a, PartTag> {
        Box::pin(async move {
            let mut state = self.state.write();
            let pending = state
                .uploads
                .get_mut(&upload.upload_id)
                .ok_or_else(|| no_such_upload(upload))?;
            pending
                .parts
                .insert(part_index, Bytes::copy_from_slice(data));
            Ok(PartTag {
                part_index,
                tag: part_checksum(data),
            })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write();
            let pending = state
                .uploads
                .get(&upload.upload_id)
                .ok_or_else(|| no_such_upload(upload))?;
            check_completion(upload, &pending.parts, parts)?;

            let mut assembled = Vec::new();
            for part in parts {
                assembled.extend_from_slice(&pending.parts[&part.part_index]);
            }
            let key = pending.key.clone();
            state.uploads.remove(&upload.upload_id);
            state.objects.insert(key, Bytes::from(assembled));
            Ok(())
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            // Aborting an unknown upload is a no-op, as on S3
            self.state.write().uploads.remove(&upload.upload_id);
            Ok(())
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

const MULTIPART_DIR: &str = ".multipart";

/// Local filesystem object store for development and testing
///
/// Multipart parts are staged under `<base>/.multipart/<upload_id>/` and
/// concatenated into place on completion.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
    next_upload_id: Arc<AtomicU64>,
}

impl LocalFsObjectStore {
    /// Create a new local filesystem object store
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore {
            base_path,
            next_upload_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the full path for a key
    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_index: usize) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("{:05}.part", part_index))
    }

    /// Ensure parent directories exist
    async fn ensure_parent(path: &std::path::Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write to a temp sibling, then rename into place
    async fn write_atomic(path: &std::path::Path, data: &[u8]) -> IoResult<()> {
        Self::ensure_parent(path).await?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Get the base path (for testing)
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> StoreFuture<'a, ()> {
        Box::pin(async move { Self::write_atomic(&self.full_path(key), data).await })
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn exists<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.full_path(key)).await })
    }

    fn initiate_multipart<'a>(&'a self, key: &'a str) -> StoreFuture<'a, MultipartUpload> {
        Box::pin(async move {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            let seq = self.next_upload_id.fetch_add(1, Ordering::SeqCst);
            let upload_id = format!("{}-{}", nanos, seq);
            tokio::fs::create_dir_all(self.upload_dir(&upload_id)).await?;
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
            if !tokio::fs::try_exists(self.upload_dir(&upload.upload_id)).await? {
                return Err(no_such_upload(upload));
            }
            tokio::fs::write(self.part_path(&upload.upload_id, part_index), data).await?;
            Ok(PartTag {
                part_index,
                tag: part_checksum(data),
            })
        })
    }

    fn complete_multipart<'a>(
        &'a self,
        upload: &'a MultipartUpload,
        parts: &'a [PartTag],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if !tokio::fs::try_exists(self.upload_dir(&upload.upload_id)).await? {
                return Err(no_such_upload(upload));
            }
            let mut stored = BTreeMap::new();
            for part in parts {
                let data = tokio::fs::read(self.part_path(&upload.upload_id, part.part_index))
                    .await
                    .map_err(|e| {
                        IoError::new(
                            ErrorKind::InvalidInput,
                            format!("Upload {} part {}: {}", upload.upload_id, part.part_index, e),
                        )
                    })?;
                stored.insert(part.part_index, Bytes::from(data));
            }
            check_completion(upload, &stored, parts)?;

            let mut assembled = Vec::new();
            for data in stored.values() {
                assembled.extend_from_slice(data);
            }
            Self::write_atomic(&self.full_path(&upload.key), &assembled).await?;
            tokio::fs::remove_dir_all(self.upload_dir(&upload.upload_id)).await
        })
    }

    fn abort_multipart<'a>(&'a self, upload: &'a MultipartUpload) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_dir_all(self.upload_dir(&upload.upload_id)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()), // Already gone
                Err(e) => Err(e),
            }
        })
    }
}
