use crate::{DataNodeId, DiskId, PartitionId, ReplicaId, StoreError, StoreResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Authoritative replica placement, as seen by this node.
pub trait ClusterMap: Send + Sync {
    /// All replicas assigned to `node`.
    fn get_replica_ids(&self, node: &DataNodeId) -> Vec<ReplicaId>;

    /// Allocate a brand-new replica of `partition_name` on `node`. A
    /// successful allocation decreases the chosen disk's available bytes by
    /// the replica capacity; the caller must restore them if it fails to
    /// materialize the replica.
    fn get_bootstrap_replica(&self, partition_name: &str, node: &DataNodeId)
        -> Option<ReplicaId>;

    /// Whether the coordinator manages `node` in full-auto mode, where
    /// replicas may be moved across nodes without the full local lifecycle.
    fn is_data_node_in_full_auto_mode(&self, node: &DataNodeId) -> bool;
}

pub const DEFAULT_DISK_CAPACITY_BYTES: u64 = 64 * 1024 * 1024 * 1024;
pub const DEFAULT_PARTITION_CAPACITY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskEntry {
    #[serde(alias = "path", alias = "mount")]
    pub mount_path: PathBuf,
    #[serde(alias = "capacity")]
    pub capacity_bytes: u64,
}

impl Default for DiskEntry {
    fn default() -> Self {
        Self {
            mount_path: PathBuf::new(),
            capacity_bytes: DEFAULT_DISK_CAPACITY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionEntry {
    pub id: u64,
    #[serde(alias = "capacity")]
    pub capacity_bytes: u64,
    /// Mount path of the disk hosting this partition's local replica.
    /// Absent for partitions known to the cluster but not hosted here;
    /// those stay eligible for dynamic bootstrap placement.
    #[serde(alias = "disk")]
    pub mount_path: Option<PathBuf>,
}

impl Default for PartitionEntry {
    fn default() -> Self {
        Self {
            id: 0,
            capacity_bytes: DEFAULT_PARTITION_CAPACITY_BYTES,
            mount_path: None,
        }
    }
}

/// On-disk topology description loaded by the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterTopologyConfig {
    pub full_auto: bool,
    pub disks: Vec<DiskEntry>,
    pub partitions: Vec<PartitionEntry>,
}

/// A clustermap built once from a topology config file. Placement never
/// changes after load except through bootstrap-replica allocation
/// bookkeeping on the disks.
pub struct StaticClusterMap {
    node: DataNodeId,
    full_auto: bool,
    disks: Vec<DiskId>,
    replicas: Vec<ReplicaId>,
    partition_capacities: HashMap<u64, u64>,
}

impl StaticClusterMap {
    pub fn from_config(node: DataNodeId, config: &ClusterTopologyConfig) -> StoreResult<Self> {
        let mut disks_by_mount: HashMap<PathBuf, DiskId> = HashMap::new();
        let mut disks = Vec::new();
        for entry in &config.disks {
            if entry.mount_path.as_os_str().is_empty() {
                return Err(StoreError::InvalidParam(
                    "disk entry with empty mount path".to_string(),
                ));
            }
            if disks_by_mount.contains_key(&entry.mount_path) {
                return Err(StoreError::InvalidParam(format!(
                    "duplicate disk mount path {}",
                    entry.mount_path.to_string_lossy()
                )));
            }
            let disk = DiskId::new(entry.mount_path.clone(), entry.capacity_bytes);
            disks_by_mount.insert(entry.mount_path.clone(), disk.clone());
            disks.push(disk);
        }

        let mut replicas = Vec::new();
        let mut partition_capacities = HashMap::new();
        for entry in &config.partitions {
            if partition_capacities
                .insert(entry.id, entry.capacity_bytes)
                .is_some()
            {
                return Err(StoreError::InvalidParam(format!(
                    "duplicate partition id {}",
                    entry.id
                )));
            }
            if let Some(mount_path) = &entry.mount_path {
                let disk = disks_by_mount.get(mount_path).ok_or_else(|| {
                    StoreError::InvalidParam(format!(
                        "partition {} references unknown disk {}",
                        entry.id,
                        mount_path.to_string_lossy()
                    ))
                })?;
                // Hosted replicas consume their capacity up front.
                disk.decrease_available_space(entry.capacity_bytes);
                replicas.push(ReplicaId::new(
                    PartitionId(entry.id),
                    disk.clone(),
                    entry.capacity_bytes,
                ));
            }
        }

        info!(
            "StaticClusterMap: loaded {} disks, {} local replicas for {}",
            disks.len(),
            replicas.len(),
            node
        );
        Ok(Self {
            node,
            full_auto: config.full_auto,
            disks,
            replicas,
            partition_capacities,
        })
    }

    pub async fn from_file(node: DataNodeId, path: &Path) -> StoreResult<Self> {
        let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
            warn!(
                "StaticClusterMap: read topology {} failed: {}",
                path.to_string_lossy(),
                e
            );
            StoreError::NotFound(format!("topology config not found: {}", e))
        })?;
        let config: ClusterTopologyConfig = serde_json::from_str(&config_str).map_err(|e| {
            warn!("StaticClusterMap: parse topology failed: {}", e);
            StoreError::InvalidParam(format!("topology config invalid: {}", e))
        })?;
        Self::from_config(node, &config)
    }

    pub fn disks(&self) -> &[DiskId] {
        &self.disks
    }
}

impl ClusterMap for StaticClusterMap {
    fn get_replica_ids(&self, node: &DataNodeId) -> Vec<ReplicaId> {
        if node == &self.node {
            self.replicas.clone()
        } else {
            Vec::new()
        }
    }

    fn get_bootstrap_replica(
        &self,
        partition_name: &str,
        node: &DataNodeId,
    ) -> Option<ReplicaId> {
        if node != &self.node {
            return None;
        }
        let partition = PartitionId::from_path_string(partition_name)?;
        let capacity = *self.partition_capacities.get(&partition.0)?;
        let disk = self
            .disks
            .iter()
            .filter(|d| d.available_space_in_bytes() >= capacity)
            .max_by_key(|d| d.available_space_in_bytes())?;
        disk.decrease_available_space(capacity);
        info!(
            "StaticClusterMap: allocated bootstrap replica for partition {} on {}",
            partition_name,
            disk.mount_path().to_string_lossy()
        );
        Some(ReplicaId::new(partition, disk.clone(), capacity))
    }

    fn is_data_node_in_full_auto_mode(&self, node: &DataNodeId) -> bool {
        self.full_auto && node == &self.node
    }
}
