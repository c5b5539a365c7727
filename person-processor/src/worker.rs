use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::WorkerError;
use crate::health::{HealthHandle, HealthRegistry};
use crate::metrics_consts::{
    INTAKE_REJECTED_COUNTER, LANE_SATURATION_GAUGE, WORKER_EVENT_FAILURES_COUNTER,
};
use crate::pipeline::EventPipeline;
use crate::types::Event;

/// Fans events out to a fixed set of lanes, each processing its events in order.
///
/// Events are routed by a hash of `distinct_id`, so events of one user usually share a
/// lane and rarely contend. Correctness never depends on it: the store's version
/// guards serialize writes across lanes and processes.
pub struct Worker {
    lanes: Vec<mpsc::Sender<Event>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn `lanes` lane tasks, each registered with `liveness`.
    pub fn start(
        pipeline: Arc<EventPipeline>,
        lanes: usize,
        lane_buffer_size: usize,
        liveness: &HealthRegistry,
        health_deadline: Duration,
    ) -> Self {
        let lanes = lanes.max(1);
        let deadline = Duration::max(health_deadline, Duration::from_millis(2));
        let heartbeat = deadline / 2;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(lane_buffer_size.max(1));
            let handle = liveness.register(
                format!("lane-{lane}"),
                time::Duration::try_from(deadline).unwrap_or(time::Duration::seconds(30)),
            );
            handles.push(tokio::spawn(run_lane(
                lane,
                pipeline.clone(),
                rx,
                shutdown_rx.clone(),
                handle,
                heartbeat,
            )));
            senders.push(tx);
        }

        info!(lanes, lane_buffer_size, "worker started");
        Self {
            lanes: senders,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_for(&self, distinct_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        distinct_id.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Enqueue an event, waiting for room in its lane.
    pub async fn submit(&self, event: Event) -> Result<(), WorkerError> {
        let lane = self.lane_for(&event.distinct_id);
        let sender = &self.lanes[lane];
        sender
            .send(event)
            .await
            .map_err(|_| WorkerError::Closed)?;
        report_saturation(lane, sender);
        Ok(())
    }

    /// Enqueue an event without waiting. Fails with `LaneFull` when its lane is at capacity.
    pub fn try_submit(&self, event: Event) -> Result<(), WorkerError> {
        let lane = self.lane_for(&event.distinct_id);
        let sender = &self.lanes[lane];
        match sender.try_send(event) {
            Ok(()) => {
                report_saturation(lane, sender);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(INTAKE_REJECTED_COUNTER, "reason" => "lane_full").increment(1);
                Err(WorkerError::LaneFull(lane))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(WorkerError::Closed),
        }
    }

    /// Stop accepting events, finish the queued ones and wait for every lane to exit.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for result in join_all(handles).await {
            if let Err(error) = result {
                error!(error = %error, "worker lane panicked");
            }
        }
        info!("worker stopped");
    }
}

fn report_saturation(lane: usize, sender: &mpsc::Sender<Event>) {
    let used = 1f64 - sender.capacity() as f64 / sender.max_capacity() as f64;
    metrics::gauge!(LANE_SATURATION_GAUGE, "lane" => lane.to_string()).set(used);
}

async fn run_lane(
    lane: usize,
    pipeline: Arc<EventPipeline>,
    mut events: mpsc::Receiver<Event>,
    mut shutdown: watch::Receiver<bool>,
    liveness: HealthHandle,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closing = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => liveness.report_healthy(),
            _ = shutdown.changed(), if !closing => {
                // Closing the receiver rejects new sends but still yields queued events.
                closing = true;
                events.close();
                debug!(lane, "lane closing");
            }
            received = events.recv() => match received {
                Some(event) => {
                    let uuid = event.uuid;
                    if let Err(error) = pipeline.process(event).await {
                        error!(lane, event_uuid = %uuid, error = %error, "event was neither processed nor overflowed");
                        metrics::counter!(WORKER_EVENT_FAILURES_COUNTER).increment(1);
                    }
                    liveness.report_healthy();
                }
                None => break,
            },
        }
    }

    info!(lane, "lane drained");
}
