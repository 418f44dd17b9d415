//! Core data models for the chunked-upload engine.
//!
//! These entities map to SQLite tables via `sqlx::FromRow` and serialize
//! as JSON via `serde` where a row doubles as an API projection.

pub mod chunk;
pub mod quota;
pub mod session;
pub mod storage_config;
pub mod video;
