use crate::{
    DataNodeId, ReplicaId, StateTransitionError, StoreResult, TransitionResult,
};
use async_trait::async_trait;
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Kinds of partition state-change listeners a participant can host. Each
/// manager on the node registers at most one listener per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateModelListenerType {
    StorageManagerListener,
    ReplicationManagerListener,
    StatsManagerListener,
}

/// Callback surface invoked by a cluster participant as the coordinator
/// moves a replica through its lifecycle. Callbacks for one partition are
/// serialized by the participant; callbacks for different partitions may
/// interleave arbitrarily.
#[async_trait]
pub trait PartitionStateChangeListener: Send + Sync {
    async fn on_become_bootstrap_from_offline(&self, partition_name: &str)
        -> TransitionResult<()>;
    async fn on_become_standby_from_bootstrap(&self, partition_name: &str)
        -> TransitionResult<()>;
    async fn on_become_leader_from_standby(&self, partition_name: &str) -> TransitionResult<()>;
    async fn on_become_standby_from_leader(&self, partition_name: &str) -> TransitionResult<()>;
    async fn on_become_inactive_from_standby(&self, partition_name: &str)
        -> TransitionResult<()>;
    async fn on_become_offline_from_inactive(&self, partition_name: &str)
        -> TransitionResult<()>;
    async fn on_become_dropped_from_offline(&self, partition_name: &str)
        -> TransitionResult<()>;
}

/// Cluster-wide barriers used during bootstrap and decommission. The waits
/// are the only intentionally-unbounded suspensions in the node; they return
/// on sync-up completion and fail when the barrier is aborted.
#[async_trait]
pub trait ReplicaSyncUpManager: Send + Sync {
    async fn wait_deactivation_completed(&self, partition_name: &str) -> StoreResult<()>;
    async fn wait_disconnection_completed(&self, partition_name: &str) -> StoreResult<()>;
}

/// One cluster-coordination client on this node. In the common case there is
/// exactly one; during coordinator migrations a node may briefly carry two,
/// in which case the first is primary and the rest are secondary.
#[async_trait]
pub trait ClusterParticipant: Send + Sync {
    async fn register_partition_state_change_listener(
        &self,
        listener_type: StateModelListenerType,
        listener: Arc<dyn PartitionStateChangeListener>,
    );

    /// Seed the participant with the set of partition names hosted locally
    /// at startup.
    async fn set_initial_local_partitions(&self, partitions: HashSet<String>) -> StoreResult<()>;

    /// Add or remove one replica in the coordinator-side node config.
    /// `Ok(false)` means the coordinator rejected the update;
    /// `Err(InvalidState)` means the participant is in no shape to attempt
    /// it. Both surface as a cluster update failure to transition callers.
    async fn update_data_node_info_in_cluster(
        &self,
        replica: &ReplicaId,
        add: bool,
    ) -> StoreResult<bool>;

    fn get_replica_sync_up_manager(&self) -> Option<Arc<dyn ReplicaSyncUpManager>>;

    async fn get_partition_state_change_listeners(
        &self,
    ) -> HashMap<StateModelListenerType, Arc<dyn PartitionStateChangeListener>>;

    /// Persist the administrative stopped flag for the given replicas.
    async fn set_replica_stopped_state(
        &self,
        replicas: &[ReplicaId],
        stopped: bool,
    ) -> StoreResult<bool>;

    async fn get_stopped_replicas(&self) -> HashSet<String>;

    fn local_node(&self) -> &DataNodeId;
}

/// Thin wrapper over one participant that owns the stopped-replica
/// persistence for the stores. One delegate exists per participant; stop
/// state changes go through every delegate so that all coordinators agree.
pub struct ReplicaStatusDelegate {
    participant: Arc<dyn ClusterParticipant>,
}

impl ReplicaStatusDelegate {
    pub fn new(participant: Arc<dyn ClusterParticipant>) -> Self {
        Self { participant }
    }

    pub async fn get_stopped_replicas(&self) -> HashSet<String> {
        self.participant.get_stopped_replicas().await
    }

    pub async fn mark_stopped(&self, replicas: &[ReplicaId]) -> bool {
        self.set_stopped(replicas, true).await
    }

    pub async fn unmark_stopped(&self, replicas: &[ReplicaId]) -> bool {
        self.set_stopped(replicas, false).await
    }

    async fn set_stopped(&self, replicas: &[ReplicaId], stopped: bool) -> bool {
        match self
            .participant
            .set_replica_stopped_state(replicas, stopped)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!("ReplicaStatusDelegate: persisting stop state failed: {}", e);
                false
            }
        }
    }
}

/// Map a textual `<from>-<to>` transition onto the listener callback. Used
/// by participants when dispatching coordinator messages.
pub async fn dispatch_state_transition(
    listener: &dyn PartitionStateChangeListener,
    partition_name: &str,
    from: crate::ReplicaState,
    to: crate::ReplicaState,
) -> Result<(), StateTransitionError> {
    use crate::ReplicaState::*;
    match (from, to) {
        (Offline, Bootstrap) => listener.on_become_bootstrap_from_offline(partition_name).await,
        (Bootstrap, Standby) => listener.on_become_standby_from_bootstrap(partition_name).await,
        (Standby, Leader) => listener.on_become_leader_from_standby(partition_name).await,
        (Leader, Standby) => listener.on_become_standby_from_leader(partition_name).await,
        (Standby, Inactive) => listener.on_become_inactive_from_standby(partition_name).await,
        (Inactive, Offline) => listener.on_become_offline_from_inactive(partition_name).await,
        (Offline, Dropped) => listener.on_become_dropped_from_offline(partition_name).await,
        (from, to) => {
            warn!(
                "ignoring unsupported state transition {}-{} for partition {}",
                from, to, partition_name
            );
            Ok(())
        }
    }
}
