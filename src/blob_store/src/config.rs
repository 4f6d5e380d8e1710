use serde::{Deserialize, Serialize};

/// Settings for the blob stores on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Whether stores hard-delete data past the retention window. When
    /// enabled, the retention window must stay ahead of the flush interval
    /// so that hard deletes never touch unflushed log.
    pub store_enable_hard_delete: bool,
    #[serde(alias = "deleted_message_retention_minutes")]
    pub store_deleted_message_retention_minutes: u64,
    #[serde(alias = "data_flush_interval_seconds")]
    pub store_data_flush_interval_seconds: u64,
    /// How often each disk's compaction executor sweeps its stores.
    #[serde(alias = "compaction_check_interval_seconds")]
    pub store_compaction_check_interval_seconds: u64,
    /// Persist current/previous replica state in the store DB so that the
    /// previous state survives restarts. When false, a freshly loaded store
    /// reports its previous state as offline.
    pub store_persist_replica_state: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_enable_hard_delete: false,
            store_deleted_message_retention_minutes: 7 * 24 * 60,
            store_data_flush_interval_seconds: 60,
            store_compaction_check_interval_seconds: 10 * 60,
            store_persist_replica_state: true,
        }
    }
}

/// Settings for the per-disk managers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskManagerConfig {
    /// Directory name (under each mount) holding preallocated reserve
    /// files. Must be non-empty; the startup scan also uses it to tell
    /// reserve files apart from unexpected directories.
    #[serde(alias = "reserve_dir")]
    pub disk_manager_reserve_file_dir_name: String,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            disk_manager_reserve_file_dir_name: "reserve_files".to_string(),
        }
    }
}
