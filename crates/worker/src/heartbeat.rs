//! Registration and heartbeat loop
//!
//! Registers with the controller (retrying at a fixed interval until it
//! answers), then reports load on every tick. Controller outages are logged
//! and counted; they never affect request handling.

use crate::http::ControllerClient;
use crate::worker::ModelWorker;
use llmops_common::{Result, METRICS};
use llmops_proto::RegisterWorkerRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct HeartbeatTask {
    worker: Arc<ModelWorker>,
    client: ControllerClient,
    interval: Duration,
    register_retry: Duration,
}

impl HeartbeatTask {
    pub fn new(
        worker: Arc<ModelWorker>,
        client: ControllerClient,
        interval: Duration,
        register_retry: Duration,
    ) -> Self {
        Self {
            worker,
            client,
            interval,
            register_retry,
        }
    }

    /// Run in the background until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.register_until_acknowledged(&shutdown).await {
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; registration already reported state
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.beat().await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Controller lost track of this worker, registering again");
                    if !self.register_until_acknowledged(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    METRICS.heartbeat.heartbeat_failures.inc();
                    warn!("heart beat error: {}", e);
                }
            }
        }

        info!("Heartbeat task stopped");
    }

    /// Returns false if shutdown arrived first
    async fn register_until_acknowledged(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.register_once().await {
                Ok(()) => return true,
                Err(e) => {
                    METRICS.heartbeat.registration_failures.inc();
                    warn!(
                        "Register to controller {} failed: {}; retrying in {:?}",
                        self.client.base_url(),
                        e,
                        self.register_retry
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.register_retry) => {}
            }
        }
    }

    async fn register_once(&self) -> Result<()> {
        let request = RegisterWorkerRequest {
            worker_name: self.worker.identity().worker_address.clone(),
            check_heart_beat: true,
            worker_status: Some(self.worker.status()),
        };
        self.client.register(&request).await?;

        METRICS.heartbeat.registrations.inc();
        info!(
            "Registered worker {} as {}",
            self.worker.identity().worker_id,
            request.worker_name
        );
        Ok(())
    }

    /// Send one heartbeat; returns whether the controller still knows us
    async fn beat(&self) -> Result<bool> {
        let record = self.worker.heartbeat_record();
        let response = self.client.heartbeat(&record).await?;

        METRICS.heartbeat.heartbeats_sent.inc();
        debug!(
            "Send heart beat. Models: {:?}. Load: {}/{}. Queue length: {}",
            self.worker.identity().model_names,
            record.current_load,
            record.capacity,
            record.queue_length
        );
        Ok(response.exist)
    }
}
