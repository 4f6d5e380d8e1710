use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of one server node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataNodeId {
    pub hostname: String,
    pub port: u16,
}

impl DataNodeId {
    pub fn new(hostname: &str, port: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
        }
    }
}

impl fmt::Display for DataNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Identity of one replicated unit of the global key space. The path-style
/// name doubles as the on-disk directory name of its replicas.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartitionId(pub u64);

impl PartitionId {
    pub fn to_path_string(&self) -> String {
        self.0.to_string()
    }

    /// Parse a path-style partition name back into an id.
    pub fn from_path_string(name: &str) -> Option<Self> {
        name.parse::<u64>().ok().map(PartitionId)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct DiskInner {
    mount_path: PathBuf,
    raw_capacity_bytes: u64,
    available_bytes: AtomicU64,
}

/// One physical mount point. Shared by every replica placed on the disk;
/// available-space bookkeeping is atomic so that replica allocation and its
/// rollback can run from any task.
#[derive(Clone)]
pub struct DiskId {
    inner: Arc<DiskInner>,
}

impl DiskId {
    pub fn new(mount_path: PathBuf, raw_capacity_bytes: u64) -> Self {
        Self {
            inner: Arc::new(DiskInner {
                mount_path,
                raw_capacity_bytes,
                available_bytes: AtomicU64::new(raw_capacity_bytes),
            }),
        }
    }

    pub fn mount_path(&self) -> &Path {
        &self.inner.mount_path
    }

    pub fn raw_capacity_in_bytes(&self) -> u64 {
        self.inner.raw_capacity_bytes
    }

    pub fn available_space_in_bytes(&self) -> u64 {
        self.inner.available_bytes.load(Ordering::SeqCst)
    }

    /// Saturates at zero.
    pub fn decrease_available_space(&self, bytes: u64) {
        let mut current = self.inner.available_bytes.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.inner.available_bytes.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Clamped to the raw capacity.
    pub fn increase_available_space(&self, bytes: u64) {
        let mut current = self.inner.available_bytes.load(Ordering::SeqCst);
        loop {
            let next = current
                .saturating_add(bytes)
                .min(self.inner.raw_capacity_bytes);
            match self.inner.available_bytes.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

impl PartialEq for DiskId {
    fn eq(&self, other: &Self) -> bool {
        self.inner.mount_path == other.inner.mount_path
    }
}

impl Eq for DiskId {}

impl std::hash::Hash for DiskId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.mount_path.hash(state);
    }
}

impl fmt::Debug for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskId")
            .field("mount_path", &self.inner.mount_path)
            .field("raw_capacity_bytes", &self.inner.raw_capacity_bytes)
            .field("available_bytes", &self.available_space_in_bytes())
            .finish()
    }
}

struct ReplicaInner {
    partition: PartitionId,
    disk: DiskId,
    replica_path: PathBuf,
    capacity_bytes: u64,
}

/// This node's copy of one partition. The replica path always lies under the
/// owning disk's mount path.
#[derive(Clone)]
pub struct ReplicaId {
    inner: Arc<ReplicaInner>,
}

impl ReplicaId {
    pub fn new(partition: PartitionId, disk: DiskId, capacity_bytes: u64) -> Self {
        let replica_path = disk.mount_path().join(partition.to_path_string());
        Self {
            inner: Arc::new(ReplicaInner {
                partition,
                disk,
                replica_path,
                capacity_bytes,
            }),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.inner.partition
    }

    pub fn partition_name(&self) -> String {
        self.inner.partition.to_path_string()
    }

    pub fn disk_id(&self) -> &DiskId {
        &self.inner.disk
    }

    pub fn replica_path(&self) -> &Path {
        &self.inner.replica_path
    }

    pub fn capacity_in_bytes(&self) -> u64 {
        self.inner.capacity_bytes
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaId")
            .field("partition", &self.inner.partition)
            .field("replica_path", &self.inner.replica_path)
            .field("capacity_bytes", &self.inner.capacity_bytes)
            .finish()
    }
}

/// Lifecycle state of one replica, as driven by the cluster coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaState {
    Offline,
    Bootstrap,
    Standby,
    Leader,
    Inactive,
    Dropped,
    Error,
}

impl ReplicaState {
    pub fn from_str(s: &str) -> Self {
        match s {
            "offline" => ReplicaState::Offline,
            "bootstrap" => ReplicaState::Bootstrap,
            "standby" => ReplicaState::Standby,
            "leader" => ReplicaState::Leader,
            "inactive" => ReplicaState::Inactive,
            "dropped" => ReplicaState::Dropped,
            "error" => ReplicaState::Error,
            _ => ReplicaState::Offline,
        }
    }

    pub fn to_str(&self) -> &'static str {
        match self {
            ReplicaState::Offline => "offline",
            ReplicaState::Bootstrap => "bootstrap",
            ReplicaState::Standby => "standby",
            ReplicaState::Leader => "leader",
            ReplicaState::Inactive => "inactive",
            ReplicaState::Dropped => "dropped",
            ReplicaState::Error => "error",
        }
    }
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_str())
    }
}

impl ToSql for ReplicaState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.to_str().into())
    }
}

impl FromSql for ReplicaState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str().unwrap_or("offline");
        Ok(ReplicaState::from_str(s))
    }
}

/// Result of a local partition status probe, reported back to request
/// handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    NoError,
    DiskUnavailable,
    ReplicaUnavailable,
    PartitionUnknown,
}
