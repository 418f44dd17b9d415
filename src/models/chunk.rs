//! Represents one accepted piece of an upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One accepted chunk of a session.
///
/// At most one row exists per `(session_id, chunk_index)`; re-submission of
/// an already-recorded index is a no-op success, which is what makes the
/// protocol resumable. Rows are deleted in bulk once the session reaches a
/// terminal state.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadChunk {
    /// Owning session.
    pub session_id: Uuid,

    /// 0-based position within the file, unique per session.
    pub chunk_index: i64,

    /// Size of this chunk in bytes.
    pub size_bytes: i64,

    /// Where the chunk bytes live: `local:<relative path>` or `s3:<key>`.
    pub locator: String,

    pub created_at: DateTime<Utc>,
}
