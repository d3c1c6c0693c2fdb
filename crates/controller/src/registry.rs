//! Worker registry and dispatch
//!
//! Tracks registered workers, their models and reported queue lengths, and
//! picks a worker address for a model. Workers that stop sending heartbeats
//! are expired by a background task.

use crate::worker_client::WorkerClient;
use llmops_common::config::{ControllerConfig, DispatchMethod};
use llmops_common::{LlmOpsError, Result, METRICS};
use llmops_proto::{HeartbeatRecord, RegisterWorkerRequest, WorkerStatus};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Worker information for dispatch decisions
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Worker address, also the registry key
    pub worker_name: String,

    pub model_names: Vec<String>,

    pub speed: u32,

    /// Requests holding or waiting for a slot, as last reported
    pub queue_length: usize,

    pub capacity: usize,

    pub current_load: usize,

    /// Subject to heartbeat expiry
    pub check_heart_beat: bool,

    pub last_heart_beat: Instant,
}

impl WorkerInfo {
    pub fn new(worker_name: String, check_heart_beat: bool, status: WorkerStatus) -> Self {
        Self {
            worker_name,
            model_names: status.model_names,
            speed: status.speed,
            queue_length: status.queue_length,
            capacity: status.capacity,
            current_load: status.current_load,
            check_heart_beat,
            last_heart_beat: Instant::now(),
        }
    }

    /// Queue length relative to speed (lower is better)
    pub fn load_score(&self) -> f64 {
        if self.speed == 0 {
            return f64::INFINITY;
        }
        self.queue_length as f64 / self.speed as f64
    }

    pub fn serves(&self, model: &str) -> bool {
        self.model_names.iter().any(|m| m == model)
    }

    fn update_status(&mut self, status: WorkerStatus) {
        self.model_names = status.model_names;
        self.speed = status.speed;
        self.queue_length = status.queue_length;
        self.capacity = status.capacity;
        self.current_load = status.current_load;
    }
}

/// Registry of live workers
pub struct Registry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    client: WorkerClient,
    dispatch_method: DispatchMethod,
    heart_beat_expiration: Duration,
}

impl Registry {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        Ok(Self {
            workers: RwLock::new(HashMap::new()),
            client: WorkerClient::new()?,
            dispatch_method: config.dispatch_method,
            heart_beat_expiration: config.heart_beat_expiration(),
        })
    }

    /// Register a worker, replacing any previous record under the same name
    ///
    /// When the request carries no status the worker is polled for one.
    pub async fn register_worker(&self, request: RegisterWorkerRequest) -> Result<()> {
        let status = match request.worker_status {
            Some(status) => status,
            None => self.client.status(&request.worker_name).await?,
        };

        let info = WorkerInfo::new(request.worker_name.clone(), request.check_heart_beat, status);
        let count = {
            let mut workers = self.workers.write().await;
            workers.insert(request.worker_name.clone(), info);
            workers.len()
        };
        METRICS.controller.registered_workers.set(count as i64);

        info!("Register done: {}", request.worker_name);
        Ok(())
    }

    /// Record a heartbeat; false when the worker is unknown
    pub async fn receive_heart_beat(&self, record: &HeartbeatRecord) -> bool {
        METRICS.controller.heartbeats_received.inc();

        let mut workers = self.workers.write().await;
        match workers.get_mut(&record.worker_name) {
            Some(worker) => {
                worker.queue_length = record.queue_length;
                worker.current_load = record.current_load;
                worker.capacity = record.capacity;
                worker.last_heart_beat = Instant::now();
                debug!(
                    "Receive heart beat. {} queue length {}",
                    record.worker_name, record.queue_length
                );
                true
            }
            None => {
                info!("Receive unknown heart beat. {}", record.worker_name);
                false
            }
        }
    }

    pub async fn remove_worker(&self, worker_name: &str) -> bool {
        let (removed, count) = {
            let mut workers = self.workers.write().await;
            let removed = workers.remove(worker_name).is_some();
            (removed, workers.len())
        };
        METRICS.controller.registered_workers.set(count as i64);
        removed
    }

    /// Drop heartbeat-checked workers silent for longer than the expiration
    pub async fn remove_stale_workers(&self) -> Vec<String> {
        let expiration = self.heart_beat_expiration;
        let (stale, count) = {
            let mut workers = self.workers.write().await;
            let stale: Vec<String> = workers
                .values()
                .filter(|w| w.check_heart_beat && w.last_heart_beat.elapsed() > expiration)
                .map(|w| w.worker_name.clone())
                .collect();
            for name in &stale {
                workers.remove(name);
            }
            (stale, workers.len())
        };

        if !stale.is_empty() {
            METRICS.controller.expired_workers.inc_by(stale.len() as u64);
            METRICS.controller.registered_workers.set(count as i64);
            warn!("Removed stale workers: {:?}", stale);
        }
        stale
    }

    /// Re-poll every worker; unreachable workers are removed
    pub async fn refresh_all_workers(&self) -> usize {
        let names: Vec<String> = self.workers.read().await.keys().cloned().collect();

        for name in names {
            match self.client.status(&name).await {
                Ok(status) => {
                    if let Some(worker) = self.workers.write().await.get_mut(&name) {
                        worker.update_status(status);
                    }
                }
                Err(e) => {
                    warn!("Remove stale worker {}: {}", name, e);
                    self.remove_worker(&name).await;
                }
            }
        }

        self.workers.read().await.len()
    }

    /// Every model served by at least one worker, sorted
    pub async fn list_models(&self) -> Vec<String> {
        let workers = self.workers.read().await;
        let models: BTreeSet<String> = workers
            .values()
            .flat_map(|w| w.model_names.iter().cloned())
            .collect();
        models.into_iter().collect()
    }

    /// Pick a worker address for `model`
    pub async fn get_worker_address(&self, model: &str) -> Result<String> {
        let mut workers = self.workers.write().await;

        let selected = match self.dispatch_method {
            DispatchMethod::ShortestQueue => workers
                .values_mut()
                .filter(|w| w.serves(model) && w.speed > 0)
                .min_by(|a, b| {
                    a.load_score()
                        .partial_cmp(&b.load_score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|worker| {
                    // Count the dispatch until the next heartbeat corrects it
                    worker.queue_length += 1;
                    worker.worker_name.clone()
                }),
            DispatchMethod::Lottery => {
                let candidates: Vec<(&String, u32)> = workers
                    .values()
                    .filter(|w| w.serves(model) && w.speed > 0)
                    .map(|w| (&w.worker_name, w.speed))
                    .collect();
                pick_weighted(&candidates, rand::random::<f64>()).map(|name| name.to_string())
            }
        };

        match selected {
            Some(address) => {
                METRICS.controller.dispatches.inc();
                debug!("Dispatching {} to {}", model, address);
                Ok(address)
            }
            None => {
                METRICS.controller.no_worker_available.inc();
                Err(LlmOpsError::NoWorker(model.to_string()))
            }
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn worker(&self, worker_name: &str) -> Option<WorkerInfo> {
        self.workers.read().await.get(worker_name).cloned()
    }

    /// Periodically expire silent workers until the task is aborted
    pub fn start_expiry_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.heart_beat_expiration);
            interval.tick().await;

            loop {
                interval.tick().await;
                self.remove_stale_workers().await;
            }
        })
    }
}

/// Weighted choice; `roll` is uniform in `[0, 1)`
fn pick_weighted<T>(candidates: &[(T, u32)], roll: f64) -> Option<&T> {
    let total: u64 = candidates.iter().map(|(_, w)| *w as u64).sum();
    if total == 0 {
        return None;
    }

    let mut remaining = roll * total as f64;
    for (item, weight) in candidates {
        remaining -= *weight as f64;
        if remaining < 0.0 {
            return Some(item);
        }
    }
    candidates.last().map(|(item, _)| item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(models: &[&str], speed: u32, queue_length: usize) -> WorkerStatus {
        WorkerStatus {
            model_names: models.iter().map(|m| m.to_string()).collect(),
            speed,
            queue_length,
            capacity: 8,
            current_load: queue_length.min(8),
        }
    }

    fn registry(dispatch_method: DispatchMethod) -> Registry {
        Registry::new(&ControllerConfig {
            dispatch_method,
            heart_beat_expiration_secs: 30,
            ..Default::default()
        })
        .unwrap()
    }

    async fn register(registry: &Registry, name: &str, status: WorkerStatus) {
        registry
            .register_worker(RegisterWorkerRequest {
                worker_name: name.to_string(),
                check_heart_beat: true,
                worker_status: Some(status),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shortest_queue_selection() {
        let registry = registry(DispatchMethod::ShortestQueue);
        register(&registry, "http://a:21002", status(&["vicuna"], 1, 4)).await;
        register(&registry, "http://b:21002", status(&["vicuna"], 1, 1)).await;
        register(&registry, "http://c:21002", status(&["llama"], 1, 0)).await;

        assert_eq!(registry.get_worker_address("vicuna").await.unwrap(), "http://b:21002");
        // Dispatch bumps the local queue estimate
        assert_eq!(registry.worker("http://b:21002").await.unwrap().queue_length, 2);

        let err = registry.get_worker_address("mistral").await.unwrap_err();
        assert!(matches!(err, LlmOpsError::NoWorker(_)));
    }

    #[tokio::test]
    async fn test_lottery_only_picks_serving_workers() {
        let registry = registry(DispatchMethod::Lottery);
        register(&registry, "http://a:21002", status(&["vicuna"], 1, 0)).await;
        register(&registry, "http://b:21002", status(&["llama"], 1, 0)).await;

        for _ in 0..20 {
            assert_eq!(registry.get_worker_address("vicuna").await.unwrap(), "http://a:21002");
        }
    }

    #[test]
    fn test_pick_weighted() {
        let candidates = [("a", 1u32), ("b", 3u32)];
        assert_eq!(pick_weighted(&candidates, 0.0), Some(&"a"));
        assert_eq!(pick_weighted(&candidates, 0.24), Some(&"a"));
        assert_eq!(pick_weighted(&candidates, 0.26), Some(&"b"));
        assert_eq!(pick_weighted(&candidates, 0.999), Some(&"b"));
        assert_eq!(pick_weighted::<&str>(&[], 0.5), None);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_and_unknown_worker() {
        let registry = registry(DispatchMethod::ShortestQueue);
        register(&registry, "http://a:21002", status(&["vicuna"], 1, 0)).await;

        let mut record = HeartbeatRecord {
            worker_name: "http://a:21002".to_string(),
            worker_id: "a".to_string(),
            timestamp_ms: 0,
            current_load: 3,
            capacity: 8,
            queue_length: 5,
        };
        assert!(registry.receive_heart_beat(&record).await);
        assert_eq!(registry.worker("http://a:21002").await.unwrap().queue_length, 5);

        record.worker_name = "http://gone:21002".to_string();
        assert!(!registry.receive_heart_beat(&record).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_workers_expire() {
        let registry = registry(DispatchMethod::ShortestQueue);
        register(&registry, "http://a:21002", status(&["vicuna"], 1, 0)).await;
        registry
            .register_worker(RegisterWorkerRequest {
                worker_name: "http://pinned:21002".to_string(),
                check_heart_beat: false,
                worker_status: Some(status(&["vicuna"], 1, 0)),
            })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.remove_stale_workers().await, vec!["http://a:21002".to_string()]);
        assert_eq!(registry.worker_count().await, 1);
        assert_eq!(registry.list_models().await, vec!["vicuna".to_string()]);
    }

    #[tokio::test]
    async fn test_register_replaces_previous_record() {
        let registry = registry(DispatchMethod::ShortestQueue);
        register(&registry, "http://a:21002", status(&["vicuna"], 1, 0)).await;
        register(&registry, "http://a:21002", status(&["llama"], 1, 0)).await;

        assert_eq!(registry.worker_count().await, 1);
        assert_eq!(registry.list_models().await, vec!["llama".to_string()]);
    }
}
