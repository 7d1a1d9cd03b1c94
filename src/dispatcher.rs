//! # Worker Pool Dispatcher
//!
//! One tokio task per configured machine, grouped in pools by instance
//! type. Every pool has its own [`WorkQueue`]; the tasks of a pool drain it
//! concurrently and run each unit through the shared [`UnitExecutor`].
//!
//! Outcomes, successful or not, go to a single results channel shared by all
//! pools. The channel closes once every worker task has finished, which is
//! how the coordinator learns that all work is done.
//!
//! ## Stopping
//!
//! A worker stops when its queue is closed and drained, or when the
//! cancellation token fires. Cancellation is observed between units only:
//! a unit already running is not interrupted, its result is just no longer
//! delivered.

use crate::batch::{BatchSpec, WorkUnit};
use crate::error::UnitError;
use crate::queue::WorkQueue;
use crate::report::Measurement;
use crate::runner::{UnitExecutor, UnitJob};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

/// Outcome of one work unit.
#[derive(Debug)]
pub struct UnitResult {
    pub instance_type: String,
    /// Index of the machine within its pool
    pub worker_id: usize,
    pub unit: WorkUnit,
    pub result: Result<Measurement, UnitError>,
}

/// Handles to a running set of worker pools.
pub struct Dispatch {
    /// Queue per instance type that has at least one worker
    pub queues: BTreeMap<String, WorkQueue<WorkUnit>>,
    pub results: mpsc::Receiver<UnitResult>,
    /// Resolves to the number of worker tasks that panicked
    pub supervisor: JoinHandle<usize>,
}

/// Spawn the worker pools for every instance type of `batch`.
///
/// Workers start waiting on their (still empty) queues immediately; the
/// caller feeds and then closes the queues.
pub fn spawn(
    batch: Arc<BatchSpec>,
    executor: Arc<dyn UnitExecutor>,
    cancel: CancellationToken,
) -> Dispatch {
    let worker_count: usize = batch.workers.values().map(Vec::len).sum();
    let (tx, rx) = mpsc::channel(worker_count.max(1));

    let mut queues = BTreeMap::new();
    let mut handles = Vec::with_capacity(worker_count);

    for (itype, machines) in &batch.workers {
        let queue = WorkQueue::new();
        queues.insert(itype.clone(), queue.clone());

        for id in 0..machines.len() {
            info!(instance_type = %itype, worker = id, "starting worker");
            let task = WorkerTask {
                batch: Arc::clone(&batch),
                executor: Arc::clone(&executor),
                queue: queue.clone(),
                results: tx.clone(),
                cancel: cancel.clone(),
                instance_type: itype.clone(),
                id,
            };
            let span = info_span!("worker", instance_type = %itype, worker = id);
            handles.push(tokio::spawn(task.run().instrument(span)));
        }
    }
    // the channel closes once the last worker drops its sender
    drop(tx);

    let supervisor = tokio::spawn(async move {
        let mut panicked = 0;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed");
                panicked += 1;
            }
        }
        debug!("all workers stopped");
        panicked
    });

    Dispatch {
        queues,
        results: rx,
        supervisor,
    }
}

struct WorkerTask {
    batch: Arc<BatchSpec>,
    executor: Arc<dyn UnitExecutor>,
    queue: WorkQueue<WorkUnit>,
    results: mpsc::Sender<UnitResult>,
    cancel: CancellationToken,
    instance_type: String,
    id: usize,
}

impl WorkerTask {
    async fn run(self) {
        loop {
            let unit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("stopping worker (cancelled)");
                    return;
                }
                unit = self.queue.pop() => match unit {
                    Some(unit) => unit,
                    None => {
                        info!("stopping worker (queue closed)");
                        return;
                    }
                },
            };

            let result = self.execute(unit).await;
            let outcome = UnitResult {
                instance_type: self.instance_type.clone(),
                worker_id: self.id,
                unit,
                result,
            };

            tokio::select! {
                sent = self.results.send(outcome) => {
                    if sent.is_err() {
                        info!("stopping worker (collector gone)");
                        return;
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("stopping worker (cancelled)");
                    return;
                }
            }
        }
    }

    async fn execute(&self, unit: WorkUnit) -> Result<Measurement, UnitError> {
        let worker = self
            .batch
            .workers
            .get(&self.instance_type)
            .and_then(|w| w.get(self.id))
            .ok_or_else(|| UnitError::UnknownInstanceType(self.instance_type.clone()))?;
        let series = self
            .batch
            .series(&self.instance_type, unit.series)
            .ok_or_else(|| UnitError::UnknownInstanceType(self.instance_type.clone()))?;
        let datastore = self.batch.datastores.get(unit.datastore).ok_or_else(|| {
            UnitError::Env(anyhow::anyhow!("unknown datastore index {}", unit.datastore))
        })?;

        info!(
            series = %series.plot_name,
            datastore = %datastore.name,
            point = unit.point,
            backend = worker.exec.backend_name(),
            "running unit"
        );
        let started = Instant::now();

        let res = self
            .executor
            .execute(UnitJob {
                worker,
                datastore,
                series,
                point: unit.point,
            })
            .await;

        debug!(
            elapsed = %crate::utils::format_duration(started.elapsed()),
            ok = res.is_ok(),
            "unit finished"
        );
        res
    }
}
