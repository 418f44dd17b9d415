//! Process-wide storage configuration, read from a single admin-managed row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which backend receives uploaded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Payloads confined under the local storage root.
    Local,
    /// S3-compatible object store configured from this row.
    S3,
}

/// The single `storage_config` row.
///
/// Owned by an external admin surface and only read here, through a
/// short-TTL cache. Credentials are optional because the local backend
/// needs none of them.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StorageConfiguration {
    pub provider: StorageBackend,

    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    /// Path-style bucket addressing, required by most self-hosted stores.
    pub s3_force_path_style: bool,

    /// Ceiling on a single declared upload size, in bytes.
    pub max_file_size: i64,

    /// Limit assigned to a quota row created lazily.
    pub default_quota: i64,

    /// Horizon after which an unfinished session may be reaped.
    pub session_ttl_hours: i64,

    /// How long terminal session rows are kept before hard deletion.
    pub retention_days: i64,

    /// Validity window of presigned chunk-upload URLs.
    pub presign_ttl_secs: i64,
}

impl StorageConfiguration {
    /// True when the object-store backend is active and minimally configured.
    pub fn object_store_ready(&self) -> bool {
        self.provider == StorageBackend::S3 && self.s3_bucket.is_some()
    }
}
