//! Shared application state carried by the router.

use crate::services::{
    catalog_service::CatalogService, reaper::Reaper, storage_provider::StorageProvider,
    upload_service::UploadService,
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub storage_root: PathBuf,
    pub uploads: UploadService,
    pub catalog: CatalogService,
    pub provider: StorageProvider,
    pub reaper: Reaper,
}
