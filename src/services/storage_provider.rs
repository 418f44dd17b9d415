//! Storage provider abstraction: local filesystem tree or an S3-compatible
//! object store, selected by the cached `storage_config` row.
//!
//! Local payloads live beneath a single root directory and every resolved
//! path must stay within it. Object-store clients are rebuilt from the
//! cached configuration per operation, so credential or endpoint changes
//! take effect within one cache TTL.

use crate::errors::{UploadError, UploadResult};
use crate::models::storage_config::StorageConfiguration;
use crate::services::config_cache::ConfigCache;
use aws_sdk_s3::{
    self as s3,
    config::{BehaviorVersion, Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_LOCATOR_LEN: usize = 1024;

/// Where a payload lives: a path relative to the local storage root, or an
/// object key in the configured bucket. Serialized as `local:<path>` /
/// `s3:<key>` in chunk and video rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Local(String),
    Remote(String),
}

impl Locator {
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(rel) = raw.strip_prefix("local:") {
            Some(Self::Local(rel.to_string()))
        } else if let Some(key) = raw.strip_prefix("s3:") {
            Some(Self::Remote(key.to_string()))
        } else {
            None
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(rel) => write!(f, "local:{}", rel),
            Self::Remote(key) => write!(f, "s3:{}", key),
        }
    }
}

/// Result of a completed local write.
#[derive(Debug)]
pub struct WrittenFile {
    pub size_bytes: i64,
    pub etag: String,
}

/// Uniform put/delete/presign/multipart operations over the two backends.
#[derive(Clone)]
pub struct StorageProvider {
    root: PathBuf,
    cache: ConfigCache,
}

impl StorageProvider {
    pub fn new(root: impl Into<PathBuf>, cache: ConfigCache) -> Self {
        Self {
            root: root.into(),
            cache,
        }
    }

    /// Relative path validation to keep payloads inside the storage root.
    ///
    /// Rejects empty or oversized paths, absolute paths, `..` components
    /// and control characters.
    fn ensure_relative_safe(rel: &str) -> UploadResult<()> {
        if rel.is_empty() || rel.len() > MAX_LOCATOR_LEN {
            return Err(UploadError::PathTraversal);
        }
        if rel.starts_with('/') || rel.contains("..") {
            return Err(UploadError::PathTraversal);
        }
        if rel
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(UploadError::PathTraversal);
        }
        Ok(())
    }

    /// Resolve a relative locator to an absolute path under the root.
    pub fn resolve_local(&self, rel: &str) -> UploadResult<PathBuf> {
        Self::ensure_relative_safe(rel)?;
        Ok(self.root.join(rel))
    }

    /// Stream bytes to `rel` under the storage root.
    ///
    /// Writes incrementally to a temporary file, computes size and MD5 while
    /// streaming, fsyncs, then atomically renames into place. Temp files are
    /// removed on any error.
    pub async fn write_local<S>(&self, rel: &str, stream: S) -> UploadResult<WrittenFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let file_path = self.resolve_local(rel)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(UploadError::PathTraversal)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(UploadError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(UploadError::Io(err));
            }
        }

        Ok(WrittenFile {
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Open a local payload for streaming out.
    pub async fn open_local(&self, rel: &str) -> UploadResult<File> {
        let path = self.resolve_local(rel)?;
        File::open(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                UploadError::NotFound
            } else {
                UploadError::Io(err)
            }
        })
    }

    /// Remove a local payload, tolerating files already gone, and prune
    /// now-empty parent directories.
    pub async fn delete_local(&self, rel: &str) -> UploadResult<()> {
        let path = self.resolve_local(rel)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed local payload {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", path.display());
            }
            Err(err) => return Err(UploadError::Io(err)),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent, &self.root).await;
        }
        Ok(())
    }

    /// Recursively remove a local directory (a session's chunk tree).
    /// Missing directories are not an error.
    pub async fn delete_local_dir(&self, rel: &str) -> UploadResult<()> {
        let path = self.resolve_local(rel)?;
        if let Err(err) = fs::remove_dir_all(&path).await {
            if err.kind() != ErrorKind::NotFound {
                return Err(UploadError::Io(err));
            }
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the storage root.
    ///
    /// Stops when a directory is not empty, not found, the root is reached,
    /// or an unexpected I/O error occurs.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Handle on the configured object store.
    ///
    /// Fails with a validation error when the active backend is local or the
    /// bucket is missing, which the presign endpoint surfaces as a 400.
    pub async fn object_store(&self) -> UploadResult<ObjectStore> {
        let cfg = self.cache.get().await?;
        if !cfg.object_store_ready() {
            return Err(UploadError::Validation(
                "object store is not configured".into(),
            ));
        }
        let bucket = cfg.s3_bucket.clone().unwrap_or_default();
        let presign_ttl = Duration::from_secs(cfg.presign_ttl_secs.max(1) as u64);
        let client = build_client(&cfg).await;
        Ok(ObjectStore {
            client,
            bucket,
            presign_ttl,
        })
    }
}

/// Build an S3 client from the configuration row, falling back to the
/// ambient AWS credential chain when the row carries no static keys.
async fn build_client(cfg: &StorageConfiguration) -> s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = cfg.s3_region.clone() {
        loader = loader.region(Region::new(region));
    }
    if let Some(endpoint) = cfg.s3_endpoint.clone() {
        loader = loader.endpoint_url(endpoint);
    }
    if let (Some(access_key), Some(secret_key)) = (&cfg.s3_access_key, &cfg.s3_secret_key) {
        loader = loader.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "storage-config",
        ));
    }
    let shared = loader.load().await;

    let conf = s3::config::Builder::from(&shared)
        .force_path_style(cfg.s3_force_path_style)
        .build();
    s3::Client::from_conf(conf)
}

fn provider_err(err: impl fmt::Display) -> UploadError {
    UploadError::Provider(err.to_string())
}

/// A bucket-scoped client built from the configuration active at the time
/// of the operation.
pub struct ObjectStore {
    client: s3::Client,
    bucket: String,
    presign_ttl: Duration,
}

impl ObjectStore {
    /// Upload a local file as a single object.
    pub async fn put_from_path(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<&str>,
    ) -> UploadResult<()> {
        let body = ByteStream::from_path(path).await.map_err(provider_err)?;
        let mut req = self.client.put_object().bucket(&self.bucket).key(key).body(body);
        if let Some(ct) = content_type {
            req = req.content_type(ct);
        }
        req.send().await.map_err(provider_err)?;
        Ok(())
    }

    /// Time-boxed URL a client can PUT one chunk to directly.
    pub async fn presign_put(&self, key: &str) -> UploadResult<String> {
        let presigning = PresigningConfig::builder()
            .expires_in(self.presign_ttl)
            .build()
            .map_err(provider_err)?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(provider_err)?;
        Ok(presigned.uri().to_string())
    }

    /// Time-boxed URL for reading an object, used for share-link redirects.
    pub async fn presign_get(&self, key: &str) -> UploadResult<String> {
        let presigning = PresigningConfig::builder()
            .expires_in(self.presign_ttl)
            .build()
            .map_err(provider_err)?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(provider_err)?;
        Ok(presigned.uri().to_string())
    }

    pub async fn delete(&self, key: &str) -> UploadResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(provider_err)?;
        Ok(())
    }

    /// Begin a multipart upload targeting `key`, returning the upload id.
    pub async fn begin_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> UploadResult<String> {
        let mut req = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        if let Some(ct) = content_type {
            req = req.content_type(ct);
        }
        let out = req.send().await.map_err(provider_err)?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| UploadError::Provider("multipart upload id missing".into()))
    }

    /// Server-side copy of an already-uploaded object into part
    /// `part_number` of a multipart upload. No bytes transit this process.
    pub async fn copy_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source_key: &str,
    ) -> UploadResult<CompletedPart> {
        let out = self
            .client
            .upload_part_copy()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .copy_source(format!("{}/{}", self.bucket, source_key))
            .send()
            .await
            .map_err(provider_err)?;

        let etag = out
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(str::to_string);
        Ok(CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(etag)
            .build())
    }

    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> UploadResult<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(provider_err)?;
        Ok(())
    }

    /// Best-effort abort; failures are logged, the reaper will still find
    /// the chunk objects.
    pub async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            debug!("failed to abort multipart upload for {}: {}", key, err);
        }
    }
}

/// Relative path of one chunk's payload in coordinated (local) mode.
pub fn chunk_rel_path(session_id: Uuid, index: i64) -> String {
    format!("chunks/{}/{}.part", session_id, index)
}

/// Object key of one chunk uploaded directly via a presigned URL.
pub fn chunk_object_key(session_id: Uuid, index: i64) -> String {
    format!("uploads/{}/{}.part", session_id, index)
}

/// Relative path of a session's whole chunk tree.
pub fn session_chunk_dir(session_id: Uuid) -> String {
    format!("chunks/{}", session_id)
}

/// Final artifact name, keyed by share id with the declared extension kept.
pub fn video_rel_path(share_id: Uuid, filename: &str) -> String {
    match Path::new(filename).extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            format!("videos/{}.{}", share_id, ext.to_ascii_lowercase())
        }
        _ => format!("videos/{}", share_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use futures::stream;

    async fn provider(root: &Path) -> StorageProvider {
        let pool = memory_pool().await;
        StorageProvider::new(root, ConfigCache::new(pool))
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(matches!(
                provider.resolve_local(bad),
                Err(UploadError::PathTraversal)
            ));
        }
        assert!(provider.resolve_local("chunks/a/0.part").is_ok());
    }

    #[tokio::test]
    async fn write_then_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;

        let body = Bytes::from_static(b"hello chunk");
        let written = provider
            .write_local(
                "chunks/s/0.part",
                stream::iter(vec![io::Result::Ok(body.clone())]),
            )
            .await
            .unwrap();
        assert_eq!(written.size_bytes, body.len() as i64);
        assert_eq!(written.etag, format!("{:x}", md5::compute(&body)));

        let on_disk = tokio::fs::read(dir.path().join("chunks/s/0.part"))
            .await
            .unwrap();
        assert_eq!(on_disk, body);

        provider.delete_local("chunks/s/0.part").await.unwrap();
        assert!(!dir.path().join("chunks/s/0.part").exists());
        // empty parents are pruned back to the root
        assert!(!dir.path().join("chunks").exists());
        // deleting again is a no-op
        provider.delete_local("chunks/s/0.part").await.unwrap();
    }

    #[tokio::test]
    async fn object_store_requires_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(dir.path()).await;
        assert!(matches!(
            provider.object_store().await,
            Err(UploadError::Validation(_))
        ));
    }

    #[test]
    fn locator_roundtrip() {
        let local = Locator::parse("local:videos/a.mp4").unwrap();
        assert_eq!(local, Locator::Local("videos/a.mp4".into()));
        assert_eq!(local.to_string(), "local:videos/a.mp4");

        let remote = Locator::parse("s3:uploads/s/0.part").unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.to_string(), "s3:uploads/s/0.part");

        assert!(Locator::parse("ftp:nope").is_none());
    }
}
