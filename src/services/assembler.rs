//! Chunk assembly: turns a session's recorded chunks into one durable
//! artifact.
//!
//! Two strategies, selected by where the chunk payloads live. Chunks
//! written through this process sit on local disk and are concatenated in
//! index order; chunks uploaded directly to the object store via presigned
//! URLs are stitched together server-side with multipart copy, so their
//! bytes never transit this process again.

use crate::errors::{UploadError, UploadResult};
use crate::models::{chunk::UploadChunk, session::UploadSession};
use crate::services::storage_provider::{Locator, StorageProvider, video_rel_path};
use md5::Context;
use std::io::ErrorKind;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, warn};
use uuid::Uuid;

const COPY_BUF_LEN: usize = 64 * 1024;

/// The single output of a successful assembly.
#[derive(Debug)]
pub struct AssembledArtifact {
    pub locator: Locator,
    pub size_bytes: i64,
    /// MD5 of the assembled bytes; only known on the local path.
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct Assembler {
    provider: StorageProvider,
}

impl Assembler {
    pub fn new(provider: StorageProvider) -> Self {
        Self { provider }
    }

    /// Assemble the session's chunks into one artifact.
    ///
    /// Chunks must cover every index in `[0, total_chunks)`; a missing
    /// index is a hard `Assembly` failure naming the chunk.
    pub async fn assemble(
        &self,
        session: &UploadSession,
        chunks: &[UploadChunk],
    ) -> UploadResult<AssembledArtifact> {
        let ordered = order_chunks(session, chunks)?;

        let all_remote = ordered
            .iter()
            .all(|(_, loc)| loc.is_remote());
        if all_remote && !ordered.is_empty() {
            self.assemble_direct(session, &ordered).await
        } else {
            self.assemble_local(session, &ordered).await
        }
    }

    /// Concatenate local chunk files in ascending index order, then hand
    /// the result to the object store when that backend is active. A failed
    /// upload keeps the local copy rather than failing the whole finalize.
    async fn assemble_local(
        &self,
        session: &UploadSession,
        ordered: &[(&UploadChunk, Locator)],
    ) -> UploadResult<AssembledArtifact> {
        let out_rel = video_rel_path(session.share_id, &session.filename);
        let out_path = self.provider.resolve_local(&out_rel)?;
        let parent = out_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or(UploadError::PathTraversal)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".assemble-{}", Uuid::new_v4()));

        let result = self.concat_chunks(ordered, &tmp_path).await;
        let (size_bytes, etag) = match result {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &out_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(UploadError::Io(err));
        }

        let cfg = self.provider.object_store().await;
        if let Ok(store) = cfg {
            let key = out_rel.clone();
            match store
                .put_from_path(&key, &out_path, Some(&session.media_type))
                .await
            {
                Ok(()) => {
                    self.provider.delete_local(&out_rel).await.ok();
                    return Ok(AssembledArtifact {
                        locator: Locator::Remote(key),
                        size_bytes,
                        etag: Some(etag),
                    });
                }
                Err(err) => {
                    // keep the local copy; an external job can retry the upload
                    warn!(
                        "object store upload failed for session {}, keeping local copy: {}",
                        session.id, err
                    );
                }
            }
        }

        Ok(AssembledArtifact {
            locator: Locator::Local(out_rel),
            size_bytes,
            etag: Some(etag),
        })
    }

    async fn concat_chunks(
        &self,
        ordered: &[(&UploadChunk, Locator)],
        tmp_path: &std::path::Path,
    ) -> UploadResult<(i64, String)> {
        let mut out = File::create(tmp_path).await?;
        let mut digest = Context::new();
        let mut size_bytes: i64 = 0;
        let mut buf = vec![0u8; COPY_BUF_LEN];

        for (chunk, locator) in ordered {
            let rel = match locator {
                Locator::Local(rel) => rel,
                Locator::Remote(_) => {
                    return Err(UploadError::Assembly(format!(
                        "chunk {} not found",
                        chunk.chunk_index
                    )));
                }
            };
            let path = self.provider.resolve_local(rel)?;
            let mut file = match File::open(&path).await {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(UploadError::Assembly(format!(
                        "chunk {} not found",
                        chunk.chunk_index
                    )));
                }
                Err(err) => return Err(UploadError::Io(err)),
            };
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                digest.consume(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                size_bytes += n as i64;
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Stitch directly-uploaded chunk objects into the final key with a
    /// server-side multipart copy, then delete the redundant chunk objects.
    ///
    /// Any copy failure aborts the multipart upload and fails the finalize;
    /// the chunk objects stay behind for the reaper.
    async fn assemble_direct(
        &self,
        session: &UploadSession,
        ordered: &[(&UploadChunk, Locator)],
    ) -> UploadResult<AssembledArtifact> {
        let store = self.provider.object_store().await?;
        let key = video_rel_path(session.share_id, &session.filename);

        let upload_id = store
            .begin_multipart(&key, Some(&session.media_type))
            .await
            .map_err(|err| UploadError::Assembly(err.to_string()))?;

        let mut parts = Vec::with_capacity(ordered.len());
        for (chunk, locator) in ordered {
            let source_key = match locator {
                Locator::Remote(src) => src,
                Locator::Local(_) => {
                    store.abort_multipart(&key, &upload_id).await;
                    return Err(UploadError::Assembly(format!(
                        "chunk {} not found",
                        chunk.chunk_index
                    )));
                }
            };
            // S3 part numbers are 1-based
            let part_number = (chunk.chunk_index + 1) as i32;
            match store.copy_part(&key, &upload_id, part_number, source_key).await {
                Ok(part) => parts.push(part),
                Err(err) => {
                    store.abort_multipart(&key, &upload_id).await;
                    return Err(UploadError::Assembly(format!(
                        "copying chunk {}: {}",
                        chunk.chunk_index, err
                    )));
                }
            }
        }

        store
            .complete_multipart(&key, &upload_id, parts)
            .await
            .map_err(|err| UploadError::Assembly(err.to_string()))?;

        let mut size_bytes: i64 = 0;
        for (chunk, locator) in ordered {
            size_bytes += chunk.size_bytes;
            if let Locator::Remote(source_key) = locator {
                if let Err(err) = store.delete(source_key).await {
                    debug!("failed to delete chunk object {}: {}", source_key, err);
                }
            }
        }

        Ok(AssembledArtifact {
            locator: Locator::Remote(key),
            size_bytes,
            etag: None,
        })
    }
}

/// Pair each expected index with its chunk and parsed locator, in ascending
/// order. Fails naming the first missing index.
fn order_chunks<'a>(
    session: &UploadSession,
    chunks: &'a [UploadChunk],
) -> UploadResult<Vec<(&'a UploadChunk, Locator)>> {
    let mut ordered = Vec::with_capacity(session.total_chunks as usize);
    for index in 0..session.total_chunks {
        let chunk = chunks
            .iter()
            .find(|c| c.chunk_index == index)
            .ok_or_else(|| UploadError::Assembly(format!("chunk {} not found", index)))?;
        let locator = Locator::parse(&chunk.locator)
            .ok_or_else(|| UploadError::Assembly(format!("chunk {} not found", index)))?;
        ordered.push((chunk, locator));
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use crate::models::session::SessionStatus;
    use crate::services::config_cache::ConfigCache;
    use crate::services::storage_provider::chunk_rel_path;
    use bytes::Bytes;
    use chrono::Utc;
    use futures::stream;
    use std::io;

    fn session(total_chunks: i64) -> UploadSession {
        let now = Utc::now();
        UploadSession {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            filename: "movie.mp4".into(),
            total_size: 0,
            media_type: "video/mp4".into(),
            total_chunks,
            chunks_uploaded: total_chunks,
            status: SessionStatus::Assembling,
            share_id: Uuid::new_v4(),
            quota_reserved: true,
            reserved_bytes: 0,
            created_at: now,
            expires_at: now,
            storage_locator: None,
            error: None,
        }
    }

    async fn write_chunk(
        provider: &StorageProvider,
        session_id: Uuid,
        index: i64,
        data: &[u8],
    ) -> UploadChunk {
        let rel = chunk_rel_path(session_id, index);
        let body = Bytes::copy_from_slice(data);
        provider
            .write_local(&rel, stream::iter(vec![io::Result::Ok(body)]))
            .await
            .unwrap();
        UploadChunk {
            session_id,
            chunk_index: index,
            size_bytes: data.len() as i64,
            locator: format!("local:{}", rel),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn concatenates_in_index_order_regardless_of_arrival() {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let provider = StorageProvider::new(dir.path(), ConfigCache::new(pool));
        let assembler = Assembler::new(provider.clone());

        let session = session(3);
        // arrival order 2, 0, 1 must not matter
        let mut chunks = Vec::new();
        for index in [2i64, 0, 1] {
            let data = format!("part-{index};");
            chunks.push(write_chunk(&provider, session.id, index, data.as_bytes()).await);
        }

        let artifact = assembler.assemble(&session, &chunks).await.unwrap();
        let rel = match &artifact.locator {
            Locator::Local(rel) => rel.clone(),
            other => panic!("expected local artifact, got {other:?}"),
        };
        let bytes = fs::read(dir.path().join(&rel)).await.unwrap();
        assert_eq!(bytes, b"part-0;part-1;part-2;");
        assert_eq!(artifact.size_bytes, bytes.len() as i64);
        assert_eq!(
            artifact.etag.as_deref(),
            Some(format!("{:x}", md5::compute(&bytes)).as_str())
        );
    }

    #[tokio::test]
    async fn missing_chunk_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let provider = StorageProvider::new(dir.path(), ConfigCache::new(pool));
        let assembler = Assembler::new(provider.clone());

        let session = session(3);
        let chunks = vec![
            write_chunk(&provider, session.id, 0, b"a").await,
            write_chunk(&provider, session.id, 2, b"c").await,
        ];

        let err = assembler.assemble(&session, &chunks).await.unwrap_err();
        match err {
            UploadError::Assembly(msg) => assert_eq!(msg, "chunk 1 not found"),
            other => panic!("expected Assembly, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_file_gone_from_disk_names_the_index() {
        let dir = tempfile::tempdir().unwrap();
        let pool = memory_pool().await;
        let provider = StorageProvider::new(dir.path(), ConfigCache::new(pool));
        let assembler = Assembler::new(provider.clone());

        let session = session(2);
        let chunks = vec![
            write_chunk(&provider, session.id, 0, b"a").await,
            write_chunk(&provider, session.id, 1, b"b").await,
        ];
        provider
            .delete_local(&chunk_rel_path(session.id, 1))
            .await
            .unwrap();

        let err = assembler.assemble(&session, &chunks).await.unwrap_err();
        match err {
            UploadError::Assembly(msg) => assert_eq!(msg, "chunk 1 not found"),
            other => panic!("expected Assembly, got {other:?}"),
        }
    }
}
