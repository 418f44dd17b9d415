pub mod assembler;
pub mod catalog_service;
pub mod config_cache;
pub mod quota_service;
pub mod reaper;
pub mod storage_provider;
pub mod upload_service;
