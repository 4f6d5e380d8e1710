mod blob_log;
mod blob_store;
mod compaction;
mod config;
mod disk_mgr;
mod metrics;
mod state_listener;
mod storage_mgr;
mod store_db;

pub use blob_log::{BlobLog, LOG_FILE_NAME, LOG_HEADER_SIZE};
pub use blob_store::{
    bootstrap_file_exists, create_bootstrap_file_if_absent, create_decommission_file_if_absent,
    decommission_file_exists, delete_decommission_file, BlobStore, BOOTSTRAP_FILE_NAME,
    DECOMMISSION_FILE_NAME, STORE_DB_FILE_NAME,
};
pub use compaction::CompactionManager;
pub use config::{DiskManagerConfig, StoreConfig};
pub use disk_mgr::DiskManager;
pub use metrics::StorageManagerMetrics;
pub use state_listener::StorageManagerStateListener;
pub use storage_mgr::StorageManager;
pub use store_db::{BlobIndexEntry, BlobStoreDB};

#[cfg(test)]
mod test_storage_mgr;
#[cfg(test)]
pub(crate) mod test_util;
