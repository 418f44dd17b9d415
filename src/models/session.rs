//! Represents one attempted chunked upload and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// Transitions only move forward:
/// `pending -> uploading -> assembling -> completed | failed`,
/// `pending | uploading -> cancelled`. `completed` and `cancelled` are
/// sinks. `failed` keeps two ways out: re-entering `assembling` when
/// finalize is retried, and `cancelled` when the owner or the reaper
/// releases the reservation it still holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Uploading,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One attempted upload, from `start` to a terminal state.
///
/// `chunks_uploaded` is monotonic and never exceeds `total_chunks`. While
/// `quota_reserved` is set, the quota ledger holds exactly `reserved_bytes`
/// against the owner; the flag is cleared when the reservation is released
/// (cancel, expiry) or consumed by a successful finalize.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque unique session key.
    pub id: Uuid,

    /// Authenticated owner of the session.
    pub owner_id: Uuid,

    /// Filename as declared by the client at `start`.
    pub filename: String,

    /// Declared total byte size of the finished file.
    pub total_size: i64,

    /// Declared MIME type, validated against the allow-list at `start`.
    pub media_type: String,

    /// Number of chunks the client promised to deliver.
    pub total_chunks: i64,

    /// Distinct chunk indices recorded so far.
    pub chunks_uploaded: i64,

    pub status: SessionStatus,

    /// Pre-generated public share identifier for the eventual video.
    pub share_id: Uuid,

    /// Whether the quota ledger currently holds a reservation for this session.
    pub quota_reserved: bool,

    /// Byte count held by that reservation.
    pub reserved_bytes: i64,

    pub created_at: DateTime<Utc>,

    /// Fixed horizon after which the reaper may cancel the session.
    pub expires_at: DateTime<Utc>,

    /// Final artifact locator, set on successful assembly.
    pub storage_locator: Option<String>,

    /// Human-readable failure reason, set when assembly fails.
    pub error: Option<String>,
}

impl UploadSession {
    /// True once every promised chunk index has been recorded.
    pub fn is_complete(&self) -> bool {
        self.chunks_uploaded == self.total_chunks
    }
}
