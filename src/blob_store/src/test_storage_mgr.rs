use crate::blob_store::{bootstrap_file_exists, decommission_file_exists};
use crate::config::{DiskManagerConfig, StoreConfig};
use crate::storage_mgr::StorageManager;
use crate::test_util::{
    events_snapshot, log_init, new_event_log, test_node, MockParticipant, RecordingListener,
    RecordingSyncUpManager,
};
use cluster_lib::{
    ClusterMap, ClusterParticipant, ClusterTopologyConfig, DiskEntry, PartitionEntry,
    PartitionId, ReplicaState, ReplicaSyncUpManager, ServerErrorCode, StateModelListenerType,
    StateTransitionError, StaticClusterMap,
};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// d0 hosts partition 1; d1 is empty but has the most free space; partition
/// 2 is known to the cluster but not hosted here yet.
fn two_disk_topology(root: &Path) -> ClusterTopologyConfig {
    ClusterTopologyConfig {
        full_auto: false,
        disks: vec![
            DiskEntry {
                mount_path: root.join("d0"),
                capacity_bytes: 1000,
            },
            DiskEntry {
                mount_path: root.join("d1"),
                capacity_bytes: 2000,
            },
        ],
        partitions: vec![
            PartitionEntry {
                id: 1,
                capacity_bytes: 100,
                mount_path: Some(root.join("d0")),
            },
            PartitionEntry {
                id: 2,
                capacity_bytes: 100,
                mount_path: None,
            },
        ],
    }
}

fn single_disk_topology(root: &Path) -> ClusterTopologyConfig {
    let mut topology = two_disk_topology(root);
    topology.disks.truncate(1);
    topology
}

async fn start_storage_manager(
    topology: &ClusterTopologyConfig,
    participants: Vec<Arc<dyn ClusterParticipant>>,
) -> (Arc<StaticClusterMap>, Arc<StorageManager>) {
    let node = test_node();
    let cluster_map =
        Arc::new(StaticClusterMap::from_config(node.clone(), topology).unwrap());
    let cluster_map_dyn: Arc<dyn ClusterMap> = cluster_map.clone();
    let storage_manager = StorageManager::new(
        StoreConfig::default(),
        DiskManagerConfig::default(),
        cluster_map_dyn,
        node,
        participants,
    )
    .await
    .unwrap();
    storage_manager.start().await.unwrap();
    (cluster_map, storage_manager)
}

async fn assert_maps_consistent(storage_manager: &Arc<StorageManager>) {
    for partition in storage_manager.get_local_partitions().await {
        let disk_manager = storage_manager
            .disk_manager_for(partition)
            .await
            .expect("every mapped partition has a disk manager");
        assert!(disk_manager.owns_partition(partition).await);
        assert!(storage_manager
            .get_replica(&partition.to_path_string())
            .await
            .is_some());
    }
}

fn disk_available(cluster_map: &StaticClusterMap, mount: &Path) -> u64 {
    cluster_map
        .disks()
        .iter()
        .find(|d| d.mount_path() == mount)
        .unwrap()
        .available_space_in_bytes()
}

#[tokio::test]
async fn test_construction_rejects_invalid_configs() {
    log_init();
    let node = test_node();
    let cluster_map: Arc<dyn ClusterMap> = Arc::new(
        StaticClusterMap::from_config(node.clone(), &ClusterTopologyConfig::default()).unwrap(),
    );

    // Hard delete with a retention window shorter than the flush interval.
    let store_config = StoreConfig {
        store_enable_hard_delete: true,
        store_deleted_message_retention_minutes: 1,
        store_data_flush_interval_seconds: 600,
        ..StoreConfig::default()
    };
    let result = StorageManager::new(
        store_config,
        DiskManagerConfig::default(),
        cluster_map.clone(),
        node.clone(),
        Vec::new(),
    )
    .await;
    assert!(matches!(
        result.err(),
        Some(cluster_lib::StoreError::Initialization(_))
    ));

    let disk_config = DiskManagerConfig {
        disk_manager_reserve_file_dir_name: String::new(),
    };
    let result = StorageManager::new(
        StoreConfig::default(),
        disk_config,
        cluster_map,
        node,
        Vec::new(),
    )
    .await;
    assert!(matches!(
        result.err(),
        Some(cluster_lib::StoreError::Initialization(_))
    ));
}

#[tokio::test]
async fn test_start_seeds_participants_and_maps() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    assert_eq!(
        participant.initial_partitions(),
        ["1".to_string()].into_iter().collect()
    );
    assert_eq!(
        storage_manager.get_local_partitions().await,
        vec![PartitionId(1)]
    );
    assert_eq!(storage_manager.disk_manager_count().await, 1);
    let replica = storage_manager.get_replica("1").await.unwrap();
    assert!(storage_manager
        .get_store(PartitionId(1), false)
        .await
        .unwrap()
        .is_started());
    assert_eq!(
        storage_manager
            .check_local_partition_status(PartitionId(1), Some(&replica))
            .await,
        ServerErrorCode::NoError
    );
    assert_eq!(
        storage_manager
            .check_local_partition_status(PartitionId(3), None)
            .await,
        ServerErrorCode::PartitionUnknown
    );
    assert_maps_consistent(&storage_manager).await;

    storage_manager.shutdown().await;
    let replica = storage_manager.get_replica("1").await.unwrap();
    assert_eq!(
        storage_manager
            .check_local_partition_status(PartitionId(1), Some(&replica))
            .await,
        ServerErrorCode::DiskUnavailable
    );
}

#[tokio::test]
async fn test_bootstrap_unknown_partition_happy_path() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let events = new_event_log();
    let participant = MockParticipant::new(events.clone(), None);
    let (cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    assert_eq!(storage_manager.disk_manager_count().await, 1);
    assert_eq!(disk_available(&cluster_map, &tmp.path().join("d1")), 2000);

    let listener = participant.storage_listener().await;
    listener.on_become_bootstrap_from_offline("2").await.unwrap();

    // A new disk manager appeared for d1 and the store is live.
    assert_eq!(storage_manager.disk_manager_count().await, 2);
    let store = storage_manager.get_store(PartitionId(2), false).await.unwrap();
    assert!(store.is_started());
    assert_eq!(store.get_current_state(), ReplicaState::Bootstrap);
    let replica = storage_manager.get_replica("2").await.unwrap();
    assert!(bootstrap_file_exists(&replica));

    // Allocation bookkeeping: the chosen disk lost exactly the capacity.
    assert_eq!(disk_available(&cluster_map, &tmp.path().join("d1")), 1900);
    assert_eq!(
        events_snapshot(&events),
        vec!["participant.update_data_node_info:add:2".to_string()]
    );
    assert_maps_consistent(&storage_manager).await;
}

#[tokio::test]
async fn test_bootstrap_add_failure_restores_available_bytes() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = single_disk_topology(tmp.path());
    let events = new_event_log();
    let participant = MockParticipant::new(events.clone(), None);
    let (cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    // A plain file where the new replica wants its directory makes the
    // store-add fail after the cluster map already allocated the space.
    tokio::fs::write(tmp.path().join("d0").join("2"), b"junk")
        .await
        .unwrap();
    let before = disk_available(&cluster_map, &tmp.path().join("d0"));

    let listener = participant.storage_listener().await;
    let err = listener
        .on_become_bootstrap_from_offline("2")
        .await
        .unwrap_err();
    assert!(matches!(err, StateTransitionError::ReplicaOperationFailure(_)));

    assert_eq!(disk_available(&cluster_map, &tmp.path().join("d0")), before);
    assert!(storage_manager.get_replica("2").await.is_none());
    assert_eq!(
        storage_manager.get_local_partitions().await,
        vec![PartitionId(1)]
    );
    assert!(events_snapshot(&events).is_empty());
}

#[tokio::test]
async fn test_bootstrap_known_partition_clears_stale_decommission_marker() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    let replica = storage_manager.get_replica("1").await.unwrap();
    let store = storage_manager.get_store(PartitionId(1), false).await.unwrap();
    crate::blob_store::create_decommission_file_if_absent(&replica)
        .await
        .unwrap();
    store.set_recover_from_decommission(true);
    assert_eq!(store.get_current_state(), ReplicaState::Offline);

    let listener = participant.storage_listener().await;
    listener.on_become_bootstrap_from_offline("1").await.unwrap();

    assert!(!decommission_file_exists(&replica));
    assert!(!store.recover_from_decommission());
    // The store is empty, so it goes through a fresh bootstrap.
    assert!(bootstrap_file_exists(&replica));
    assert_eq!(store.get_current_state(), ReplicaState::Bootstrap);
}

#[tokio::test]
async fn test_secondary_listener_does_not_write_store_state() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let primary = MockParticipant::new(new_event_log(), None);
    let secondary = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) = start_storage_manager(
        &topology,
        vec![primary.clone(), secondary.clone()],
    )
    .await;

    let store = storage_manager.get_store(PartitionId(1), false).await.unwrap();
    assert_eq!(store.get_current_state(), ReplicaState::Offline);

    secondary
        .storage_listener()
        .await
        .on_become_bootstrap_from_offline("1")
        .await
        .unwrap();
    assert_eq!(store.get_current_state(), ReplicaState::Offline);

    primary
        .storage_listener()
        .await
        .on_become_bootstrap_from_offline("1")
        .await
        .unwrap();
    assert_eq!(store.get_current_state(), ReplicaState::Bootstrap);
}

#[tokio::test]
async fn test_standby_to_inactive_on_disabled_store() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    let replica = storage_manager.get_replica("1").await.unwrap();
    let store = storage_manager.get_store(PartitionId(1), false).await.unwrap();
    store.set_disabled(true);

    let listener = participant.storage_listener().await;
    let err = listener
        .on_become_inactive_from_standby("1")
        .await
        .unwrap_err();
    assert!(matches!(err, StateTransitionError::ReplicaOperationFailure(_)));

    assert!(!decommission_file_exists(&replica));
    let disk_manager = storage_manager
        .disk_manager_for(PartitionId(1))
        .await
        .unwrap();
    assert!(!disk_manager
        .compaction_manager()
        .is_compaction_disabled(PartitionId(1)));
}

#[tokio::test]
async fn test_standby_to_inactive_happy_path_and_errors() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    let replica = storage_manager.get_replica("1").await.unwrap();
    let store = storage_manager.get_store(PartitionId(1), false).await.unwrap();
    let listener = participant.storage_listener().await;

    listener.on_become_inactive_from_standby("1").await.unwrap();
    assert!(decommission_file_exists(&replica));
    assert_eq!(store.get_current_state(), ReplicaState::Inactive);
    let disk_manager = storage_manager
        .disk_manager_for(PartitionId(1))
        .await
        .unwrap();
    assert!(disk_manager
        .compaction_manager()
        .is_compaction_disabled(PartitionId(1)));

    // Marker creation is idempotent.
    listener.on_become_inactive_from_standby("1").await.unwrap();

    // Unknown replicas are rejected outright.
    let err = listener
        .on_become_inactive_from_standby("42")
        .await
        .unwrap_err();
    assert!(matches!(err, StateTransitionError::ReplicaNotFound(_)));

    // A stopped store cannot be deactivated.
    assert!(storage_manager.shutdown_blob_store(PartitionId(1)).await);
    let err = listener
        .on_become_inactive_from_standby("1")
        .await
        .unwrap_err();
    assert!(matches!(err, StateTransitionError::StoreNotStarted(_)));
}

#[tokio::test]
async fn test_dropped_resume_decommission_runs_in_order() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let events = new_event_log();
    let sync_up = RecordingSyncUpManager::new(events.clone());
    let sync_up_dyn: Arc<dyn ReplicaSyncUpManager> = sync_up.clone();
    let participant = MockParticipant::new(events.clone(), Some(sync_up_dyn));

    // A decommission marker left from a previous run makes the freshly
    // started store report recover-from-decommission.
    let replica_dir = tmp.path().join("d0").join("1");
    std::fs::create_dir_all(&replica_dir).unwrap();
    std::fs::File::create(replica_dir.join(crate::DECOMMISSION_FILE_NAME)).unwrap();

    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;
    let store = storage_manager.get_store(PartitionId(1), false).await.unwrap();
    assert!(store.recover_from_decommission());

    participant
        .register_partition_state_change_listener(
            StateModelListenerType::ReplicationManagerListener,
            RecordingListener::new("replication", events.clone()),
        )
        .await;
    participant
        .register_partition_state_change_listener(
            StateModelListenerType::StatsManagerListener,
            RecordingListener::new("stats", events.clone()),
        )
        .await;

    let listener = participant.storage_listener().await;
    let handle = tokio::spawn(async move {
        listener.on_become_dropped_from_offline("1").await
    });

    // The transition parks on the sync-up barriers until peers catch up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    sync_up.complete_deactivation("1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    sync_up.complete_disconnection("1");
    handle.await.unwrap().unwrap();

    assert_eq!(
        events_snapshot(&events),
        vec![
            "replication.inactive_from_standby:1".to_string(),
            "syncup.wait_deactivation:1".to_string(),
            "replication.offline_from_inactive:1".to_string(),
            "syncup.wait_disconnection:1".to_string(),
            "participant.update_data_node_info:remove:1".to_string(),
            "stats.dropped_from_offline:1".to_string(),
            "replication.dropped_from_offline:1".to_string(),
        ]
    );
    assert!(storage_manager.get_replica("1").await.is_none());
    assert!(storage_manager.get_local_partitions().await.is_empty());
    assert!(!replica_dir.exists());
    assert_eq!(storage_manager.metrics().resume_decommission_errors(), 0);
}

#[tokio::test]
async fn test_dropped_fails_when_sync_up_barrier_aborts() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let events = new_event_log();
    let sync_up = RecordingSyncUpManager::new(events.clone());
    let sync_up_dyn: Arc<dyn ReplicaSyncUpManager> = sync_up.clone();
    let participant = MockParticipant::new(events.clone(), Some(sync_up_dyn));

    let replica_dir = tmp.path().join("d0").join("1");
    std::fs::create_dir_all(&replica_dir).unwrap();
    std::fs::File::create(replica_dir.join(crate::DECOMMISSION_FILE_NAME)).unwrap();

    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;
    participant
        .register_partition_state_change_listener(
            StateModelListenerType::ReplicationManagerListener,
            RecordingListener::new("replication", events.clone()),
        )
        .await;

    let listener = participant.storage_listener().await;
    let handle = tokio::spawn(async move {
        listener.on_become_dropped_from_offline("1").await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Shutdown tearing down the barriers mid-decommission surfaces as a
    // replica operation failure, never a silent drop.
    sync_up.abort_sync_up("1");

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StateTransitionError::ReplicaOperationFailure(_)));
    assert_eq!(storage_manager.metrics().resume_decommission_errors(), 1);
    assert!(storage_manager.get_replica("1").await.is_some());
    assert!(replica_dir.exists());
}

#[tokio::test]
async fn test_dropped_with_replica_already_removed_purges_residual_dir() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let events = new_event_log();
    let participant = MockParticipant::new(events.clone(), None);

    // A leftover directory of a replica the coordinator already dropped.
    let residual = tmp.path().join("d0").join("7");
    std::fs::create_dir_all(&residual).unwrap();
    std::fs::write(residual.join("junk"), b"junk").unwrap();

    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;
    assert!(storage_manager
        .get_unexpected_dirs()
        .contains(&residual));

    let listener = participant.storage_listener().await;
    listener.on_become_dropped_from_offline("7").await.unwrap();

    assert!(!residual.exists());
    assert!(!storage_manager.get_unexpected_dirs().contains(&residual));
    // Nothing else happened: partition 1 is untouched, no participant calls.
    assert!(storage_manager.get_replica("1").await.is_some());
    assert!(events_snapshot(&events).is_empty());
}

#[tokio::test]
async fn test_dropped_cluster_update_failure_surfaces() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    participant.fail_data_node_update.store(true, Ordering::SeqCst);
    let listener = participant.storage_listener().await;
    let err = listener
        .on_become_dropped_from_offline("1")
        .await
        .unwrap_err();
    assert!(matches!(err, StateTransitionError::ClusterUpdateFailure(_)));
    // The replica is still known: the drop did not get to the pruning step.
    assert!(storage_manager.get_replica("1").await.is_some());
}

#[tokio::test]
async fn test_add_remove_round_trip_restores_maps() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    let (cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    let replica = cluster_map.get_bootstrap_replica("2", &test_node()).unwrap();
    assert!(storage_manager.add_blob_store(&replica).await);
    assert!(storage_manager.get_replica("2").await.is_some());
    // A second add of a mapped partition is rejected.
    assert!(!storage_manager.add_blob_store(&replica).await);
    assert_maps_consistent(&storage_manager).await;

    assert!(storage_manager
        .remove_blob_store(PartitionId(2))
        .await
        .unwrap());
    assert!(storage_manager.get_replica("2").await.is_none());
    assert_eq!(
        storage_manager.get_local_partitions().await,
        vec![PartitionId(1)]
    );
    assert!(!replica.replica_path().exists());

    // Removing a partition the manager does not hold reports false.
    assert!(!storage_manager
        .remove_blob_store(PartitionId(2))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_stopped_state_equals_union_of_delegates() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let first = MockParticipant::new(new_event_log(), None);
    let second = MockParticipant::new(new_event_log(), None);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![first.clone(), second.clone()]).await;

    let failed = storage_manager
        .set_blob_store_stopped_state(&[PartitionId(1)], true)
        .await;
    assert!(failed.is_empty());

    let mut union = first.stopped_replicas_snapshot();
    union.extend(second.stopped_replicas_snapshot());
    assert_eq!(storage_manager.get_stopped_replicas(), union);
    assert!(union.contains("1"));

    let failed = storage_manager
        .set_blob_store_stopped_state(&[PartitionId(1)], false)
        .await;
    assert!(failed.is_empty());
    let mut union = first.stopped_replicas_snapshot();
    union.extend(second.stopped_replicas_snapshot());
    assert!(union.is_empty());
    assert_eq!(storage_manager.get_stopped_replicas(), union);
}

#[tokio::test]
async fn test_stopped_replica_from_construction_stays_down() {
    log_init();
    let tmp = tempfile::TempDir::new().unwrap();
    let topology = two_disk_topology(tmp.path());
    let participant = MockParticipant::new(new_event_log(), None);
    participant.preset_stopped(&["1"]);
    let (_cluster_map, storage_manager) =
        start_storage_manager(&topology, vec![participant.clone()]).await;

    assert!(storage_manager
        .get_store(PartitionId(1), false)
        .await
        .is_none());
    assert!(storage_manager
        .get_store(PartitionId(1), true)
        .await
        .is_some());
    assert!(storage_manager.get_stopped_replicas().contains("1"));
}
