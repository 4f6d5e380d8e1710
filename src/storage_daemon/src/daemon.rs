use blob_store::{DiskManagerConfig, StorageManager, StoreConfig};
use cluster_lib::{
    ClusterMap, ClusterParticipant, ClusterTopologyConfig, DataNodeId, DiskEntry,
    LocalClusterParticipant, StaticClusterMap, StoreError, StoreResult,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;

pub const DEFAULT_NODE_CONFIG_PATH: &str = "/etc/storage_node/node_config.json";
pub const DEFAULT_TOPOLOGY_CONFIG_PATH: &str = "/etc/storage_node/topology.json";
const DEFAULT_PARTICIPANT_DIR: &str = "/var/lib/storage_node";

#[derive(Debug, Clone)]
pub struct StorageDaemonRunOptions {
    pub node_config_path: PathBuf,
    pub topology_config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    #[serde(alias = "host")]
    pub hostname: String,
    pub port: u16,
    #[serde(alias = "participant_dir")]
    pub participant_config_dir: PathBuf,
    pub store: StoreConfig,
    #[serde(alias = "disk_manager")]
    pub disk: DiskManagerConfig,
}

impl Default for NodeConfigFile {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 6667,
            participant_config_dir: PathBuf::from(DEFAULT_PARTICIPANT_DIR),
            store: StoreConfig::default(),
            disk: DiskManagerConfig::default(),
        }
    }
}

/// Read the node config, writing one with defaults on first run.
pub async fn load_or_create_node_config(path: &Path) -> StoreResult<NodeConfigFile> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::IoError(format!("create config dir failed: {}", e)))?;
        }
        let config = NodeConfigFile::default();
        let config_str = serde_json::to_string_pretty(&config)
            .map_err(|e| StoreError::InvalidParam(e.to_string()))?;
        tokio::fs::write(path, config_str)
            .await
            .map_err(|e| StoreError::IoError(format!("write node config failed: {}", e)))?;
        info!(
            "node config {} not found, wrote defaults",
            path.to_string_lossy()
        );
        return Ok(config);
    }
    let config_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        warn!("read node config failed: {}", e);
        StoreError::IoError(format!("read node config failed: {}", e))
    })?;
    serde_json::from_str(&config_str).map_err(|e| {
        warn!("parse node config failed: {}", e);
        StoreError::InvalidParam(format!("node config invalid: {}", e))
    })
}

/// Read the topology, writing a one-disk topology with no partitions on
/// first run so a fresh node comes up empty and waits for the coordinator.
pub async fn load_or_create_topology(
    path: &Path,
    default_disk_dir: &Path,
) -> StoreResult<ClusterTopologyConfig> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::IoError(format!("create config dir failed: {}", e)))?;
        }
        let topology = ClusterTopologyConfig {
            full_auto: false,
            disks: vec![DiskEntry {
                mount_path: default_disk_dir.join("disk0"),
                ..DiskEntry::default()
            }],
            partitions: Vec::new(),
        };
        let topology_str = serde_json::to_string_pretty(&topology)
            .map_err(|e| StoreError::InvalidParam(e.to_string()))?;
        tokio::fs::write(path, topology_str)
            .await
            .map_err(|e| StoreError::IoError(format!("write topology failed: {}", e)))?;
        info!(
            "topology {} not found, wrote a one-disk default",
            path.to_string_lossy()
        );
        return Ok(topology);
    }
    let topology_str = tokio::fs::read_to_string(path).await.map_err(|e| {
        warn!("read topology failed: {}", e);
        StoreError::IoError(format!("read topology failed: {}", e))
    })?;
    serde_json::from_str(&topology_str).map_err(|e| {
        warn!("parse topology failed: {}", e);
        StoreError::InvalidParam(format!("topology invalid: {}", e))
    })
}

/// A running storage node: the participant delivering coordinator
/// transitions and the storage manager owning the disks.
pub struct StorageNode {
    pub node: DataNodeId,
    pub cluster_map: Arc<StaticClusterMap>,
    pub participant: Arc<LocalClusterParticipant>,
    pub storage_manager: Arc<StorageManager>,
}

pub async fn start_node(options: &StorageDaemonRunOptions) -> StoreResult<StorageNode> {
    let node_config = load_or_create_node_config(&options.node_config_path).await?;
    let node = DataNodeId::new(&node_config.hostname, node_config.port);

    let topology = load_or_create_topology(
        &options.topology_config_path,
        &node_config.participant_config_dir,
    )
    .await?;
    let cluster_map = Arc::new(StaticClusterMap::from_config(node.clone(), &topology)?);

    let participant =
        LocalClusterParticipant::new(node.clone(), &node_config.participant_config_dir).await?;

    let cluster_map_dyn: Arc<dyn ClusterMap> = cluster_map.clone();
    let participant_dyn: Arc<dyn ClusterParticipant> = participant.clone();
    let storage_manager = StorageManager::new(
        node_config.store,
        node_config.disk,
        cluster_map_dyn,
        node.clone(),
        vec![participant_dyn],
    )
    .await?;
    storage_manager.start().await?;

    info!(
        "storage node {} is up: {} disks, {} local partitions, {} unexpected dirs",
        node,
        storage_manager.disk_manager_count().await,
        storage_manager.get_local_partitions().await.len(),
        storage_manager.get_unexpected_dirs().len()
    );
    Ok(StorageNode {
        node,
        cluster_map,
        participant,
        storage_manager,
    })
}

pub fn run_storage_daemon(options: StorageDaemonRunOptions) -> StoreResult<()> {
    let runtime = Runtime::new()
        .map_err(|e| StoreError::Initialization(format!("create runtime failed: {}", e)))?;
    runtime.block_on(async move {
        let node = start_node(&options).await?;
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| StoreError::IoError(format!("wait for ctrl-c failed: {}", e)))?;
        info!("storage node {} shutting down", node.node);
        node.storage_manager.shutdown().await;
        info!(
            "storage node stopped: start took {} ms, shutdown took {} ms",
            node.storage_manager
                .metrics()
                .start_time_ms
                .load(std::sync::atomic::Ordering::SeqCst),
            node.storage_manager
                .metrics()
                .shutdown_time_ms
                .load(std::sync::atomic::Ordering::SeqCst)
        );
        Ok(())
    })
}
