use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::ExporterMetrics;
use crate::export::registry::GaugeRegistry;
use crate::poller::Worker;
use crate::query::QueryClient;
use crate::targets::{DesiredState, TargetKey, TargetSpec};

/// Runtime record of one running worker.
struct ActiveWorker {
    spec: Arc<TargetSpec>,
    /// Gauge names this worker holds an ownership of.
    metric_names: Vec<String>,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Outcome of one reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Unchanged keys whose definition differs from the running one.
    pub stale: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Owns the worker table and the gauge registrations.
///
/// Targets are diffed by key only: a target whose interval or oids change
/// under the same name and address keeps running with the definition it was
/// started with. Call `reconcile` from a single task; taking `&mut self`
/// makes concurrent reconciliations impossible.
pub struct Reconciler<Q> {
    client: Arc<Q>,
    gauges: GaugeRegistry,
    metrics: Arc<ExporterMetrics>,
    workers: HashMap<TargetKey, ActiveWorker>,
    root: CancellationToken,
    spawned: u64,
}

impl<Q: QueryClient> Reconciler<Q> {
    /// Creates an empty reconciler. Worker tokens are children of `root`.
    pub fn new(client: Arc<Q>, metrics: Arc<ExporterMetrics>, root: CancellationToken) -> Self {
        let gauges = GaugeRegistry::new(metrics.registry().clone());
        Self {
            client,
            gauges,
            metrics,
            workers: HashMap::new(),
            root,
            spawned: 0,
        }
    }

    /// Brings the running workers in line with `desired`.
    ///
    /// Removed targets are all cancelled first and then joined, so the waits
    /// overlap. Each join can take up to that worker's interval plus its
    /// in-flight query time. If the root token fires meanwhile, pending joins
    /// are aborted and no workers are added.
    pub async fn reconcile(&mut self, desired: &DesiredState) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let to_remove: Vec<TargetKey> = self
            .workers
            .keys()
            .filter(|key| !desired.contains(key))
            .cloned()
            .collect();

        let to_add: Vec<Arc<TargetSpec>> = desired
            .targets()
            .filter(|spec| !self.workers.contains_key(&spec.key()))
            .cloned()
            .collect();

        for (key, worker) in &self.workers {
            let Some(spec) = desired.get(key) else {
                continue;
            };
            summary.unchanged += 1;
            if **spec != *worker.spec {
                summary.stale += 1;
                warn!(
                    device = %key,
                    "target definition changed but its name and address did not, keeping the running worker",
                );
            }
        }

        let stopping: Vec<(TargetKey, ActiveWorker)> = to_remove
            .into_iter()
            .filter_map(|key| self.workers.remove(&key).map(|worker| (key, worker)))
            .collect();

        for (key, worker) in &stopping {
            debug!(device = %key, "cancelling worker");
            worker.cancel.cancel();
        }

        for (key, mut worker) in stopping {
            let joined = tokio::select! {
                biased;
                joined = &mut worker.task => joined,
                _ = self.root.cancelled() => {
                    worker.task.abort();
                    (&mut worker.task).await
                }
            };
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    warn!(device = %key, error = %e, "worker task ended abnormally");
                }
            }
            for name in &worker.metric_names {
                self.gauges.release(name);
            }
            summary.removed += 1;
            info!(device = %key, "worker removed");
        }

        if self.root.is_cancelled() {
            debug!(skipped = to_add.len(), "shutting down, not starting new targets");
            self.update_metrics();
            return summary;
        }

        for spec in to_add {
            self.start_worker(spec);
            summary.added += 1;
        }

        self.update_metrics();

        summary
    }

    /// Cancels and aborts every worker without waiting for a final cycle.
    pub async fn shutdown(&mut self) {
        self.root.cancel();

        let workers: Vec<(TargetKey, ActiveWorker)> = self.workers.drain().collect();
        for (_, worker) in &workers {
            worker.task.abort();
        }
        for (key, worker) in workers {
            // Aborted tasks resolve with a cancellation error.
            let _ = worker.task.await;
            for name in &worker.metric_names {
                self.gauges.release(name);
            }
            debug!(device = %key, "worker aborted");
        }

        self.update_metrics();
        info!("all workers stopped");
    }

    /// Token whose cancellation stops every worker of this reconciler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Number of running workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Keys of the running workers, sorted.
    pub fn active_keys(&self) -> Vec<TargetKey> {
        let mut keys: Vec<TargetKey> = self.workers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Definition the worker for `key` was started with.
    pub fn running_spec(&self, key: &TargetKey) -> Option<Arc<TargetSpec>> {
        self.workers.get(key).map(|w| Arc::clone(&w.spec))
    }

    /// Spawn sequence number of the worker for `key`. Changes only when the
    /// worker is replaced.
    pub fn generation(&self, key: &TargetKey) -> Option<u64> {
        self.workers.get(key).map(|w| w.generation)
    }

    /// Total workers spawned since creation.
    pub fn spawned(&self) -> u64 {
        self.spawned
    }

    pub fn gauges(&self) -> &GaugeRegistry {
        &self.gauges
    }

    fn start_worker(&mut self, spec: Arc<TargetSpec>) {
        let key = spec.key();

        let mut gauges = BTreeMap::new();
        let mut metric_names = Vec::with_capacity(spec.oids.len());
        for value_name in spec.oids.keys() {
            let name = spec.metric_name(value_name);
            match self.gauges.acquire(&name, &spec.metric_help(value_name)) {
                Ok(gauge) => {
                    gauges.insert(value_name.clone(), gauge);
                    metric_names.push(name);
                }
                Err(e) => {
                    warn!(
                        device = %key,
                        metric = %name,
                        error = %e,
                        "registering gauge failed, value will not be published",
                    );
                }
            }
        }

        let cancel = self.root.child_token();
        let worker = Worker::new(
            Arc::clone(&spec),
            Arc::clone(&self.client),
            gauges,
            self.metrics.sample_stats(),
        );
        let task = worker.spawn(cancel.clone());

        self.spawned += 1;
        self.workers.insert(
            key.clone(),
            ActiveWorker {
                spec,
                metric_names,
                generation: self.spawned,
                cancel,
                task,
            },
        );
        info!(device = %key, "worker added");
    }

    fn update_metrics(&self) {
        self.metrics.active_workers.set(self.workers.len() as f64);
        self.metrics
            .registered_metrics
            .set(self.gauges.len() as f64);
    }
}
