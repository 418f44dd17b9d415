//! Owner identity extractor.
//!
//! Authentication itself lives upstream: a reverse proxy validates the
//! caller's session and injects `x-user-id` and `x-user-role` headers on
//! every request that reaches this service. This extractor only reads that
//! trusted identity; it never issues or verifies credentials.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";

/// The authenticated owner attached to a request.
#[derive(Debug, Clone, Copy)]
pub struct Owner {
    pub id: Uuid,
    /// Admin-role owners bypass the quota ceiling.
    pub privileged: bool,
}

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| AppError::unauthorized("missing or invalid x-user-id header"))?;

        let privileged = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|role| role.eq_ignore_ascii_case("admin"))
            .unwrap_or(false);

        Ok(Owner { id, privileged })
    }
}
