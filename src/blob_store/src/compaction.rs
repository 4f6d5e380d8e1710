use crate::blob_store::BlobStore;
use cluster_lib::PartitionId;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Per-disk compaction executor. Sweeps the disk's started stores on a
/// fixed cadence and runs explicitly scheduled passes in between. Stores can
/// be taken out of rotation per partition (decommission disables compaction
/// before the last PUT position may move).
pub struct CompactionManager {
    mount_path: PathBuf,
    check_interval: Duration,
    stores: Arc<RwLock<HashMap<PartitionId, Arc<BlobStore>>>>,
    disabled: Arc<StdMutex<HashSet<PartitionId>>>,
    queue: Arc<StdMutex<VecDeque<PartitionId>>>,
    completed: Arc<StdMutex<HashMap<PartitionId, u64>>>,
    wake: Arc<Notify>,
    stop: Arc<AtomicBool>,
    worker: StdMutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CompactionManager {
    pub fn new(
        mount_path: PathBuf,
        check_interval: Duration,
        stores: Arc<RwLock<HashMap<PartitionId, Arc<BlobStore>>>>,
    ) -> Self {
        Self {
            mount_path,
            check_interval,
            stores,
            disabled: Arc::new(StdMutex::new(HashSet::new())),
            queue: Arc::new(StdMutex::new(VecDeque::new())),
            completed: Arc::new(StdMutex::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            stop: Arc::new(AtomicBool::new(false)),
            worker: StdMutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let mount_path = self.mount_path.clone();
        let check_interval = self.check_interval;
        let stores = self.stores.clone();
        let disabled = self.disabled.clone();
        let queue = self.queue.clone();
        let completed = self.completed.clone();
        let wake = self.wake.clone();
        let stop = self.stop.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let targets: Vec<PartitionId> =
                            stores.read().await.keys().copied().collect();
                        for partition in targets {
                            Self::compact_one(&stores, &disabled, &completed, partition).await;
                        }
                    }
                    _ = wake.notified() => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        loop {
                            let next = queue.lock().unwrap().pop_front();
                            match next {
                                Some(partition) => {
                                    Self::compact_one(&stores, &disabled, &completed, partition)
                                        .await
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
            debug!(
                "compaction worker for {} exited",
                mount_path.to_string_lossy()
            );
        });
        *self.worker.lock().unwrap() = Some(handle);
    }

    async fn compact_one(
        stores: &RwLock<HashMap<PartitionId, Arc<BlobStore>>>,
        disabled: &StdMutex<HashSet<PartitionId>>,
        completed: &StdMutex<HashMap<PartitionId, u64>>,
        partition: PartitionId,
    ) {
        if disabled.lock().unwrap().contains(&partition) {
            return;
        }
        let store = match stores.read().await.get(&partition) {
            Some(store) => store.clone(),
            None => return,
        };
        if !store.is_started() || store.is_disabled() {
            return;
        }
        match store.compact_once().await {
            Ok(()) => {
                *completed.lock().unwrap().entry(partition).or_insert(0) += 1;
            }
            Err(e) => {
                warn!("compaction pass on store {} failed: {}", partition, e);
            }
        }
    }

    /// Queue one out-of-cadence pass for `partition`. Returns false when the
    /// partition is unknown to this disk or disabled for compaction.
    pub async fn schedule_next(&self, partition: PartitionId) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.disabled.lock().unwrap().contains(&partition) {
            return false;
        }
        if !self.stores.read().await.contains_key(&partition) {
            return false;
        }
        self.queue.lock().unwrap().push_back(partition);
        self.wake.notify_one();
        true
    }

    /// Take `partition` out of (or put it back into) compaction rotation.
    pub fn control_compaction(&self, partition: PartitionId, enabled: bool) {
        let mut disabled = self.disabled.lock().unwrap();
        if enabled {
            disabled.remove(&partition);
        } else {
            disabled.insert(partition);
        }
    }

    pub fn is_compaction_disabled(&self, partition: PartitionId) -> bool {
        self.disabled.lock().unwrap().contains(&partition)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self, partition: PartitionId) -> u64 {
        self.completed
            .lock()
            .unwrap()
            .get(&partition)
            .copied()
            .unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    "compaction worker for {} ended abnormally: {}",
                    self.mount_path.to_string_lossy(),
                    e
                );
            }
        }
    }
}
