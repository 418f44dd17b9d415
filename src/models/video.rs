//! Durable video artifact record, the output of a completed upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A durable video artifact in the catalog.
///
/// Created exactly once per successfully finalized session. The owner's
/// quota charge for the upload is represented by this row's `size_bytes`
/// from finalize onward, which is what `reconcile` sums over.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Video {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    pub owner_id: Uuid,

    /// Display title, derived from the declared filename.
    pub title: String,

    /// Where the assembled bytes live: `local:<relative path>` or `s3:<key>`.
    pub storage_locator: String,

    /// Content type (MIME type) as declared at upload start.
    pub media_type: Option<String>,

    /// Size of the assembled artifact in bytes.
    pub size_bytes: i64,

    /// MD5 of the assembled bytes, recorded for bookkeeping only.
    pub etag: Option<String>,

    /// Public share identifier used in shareable links.
    pub share_id: Uuid,

    pub created_at: DateTime<Utc>,

    /// Optional expiry of the share link, carried from the session.
    pub expires_at: Option<DateTime<Utc>>,
}
