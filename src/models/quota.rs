//! Per-user storage ledger row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-user storage ledger.
///
/// `used_bytes` counts committed artifacts plus bytes currently reserved by
/// in-flight sessions. The `used <= limit` ceiling is enforced only for
/// non-privileged owners; privileged owners bypass it but still accumulate
/// `used_bytes` for observability. Rows are created lazily on the first
/// quota-touching operation and never deleted while the owner exists.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UserQuota {
    pub owner_id: Uuid,

    /// Committed plus reserved bytes, never negative.
    pub used_bytes: i64,

    /// Storage ceiling in bytes.
    pub limit_bytes: i64,

    /// Lifetime count of reservations taken, for observability.
    pub upload_count: i64,
}

impl UserQuota {
    /// Bytes still available under the ceiling.
    pub fn remaining_bytes(&self) -> i64 {
        (self.limit_bytes - self.used_bytes).max(0)
    }
}
