pub mod rate;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Gauge;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::export::health::SampleStats;
use crate::query::QueryClient;
use crate::targets::TargetSpec;

use self::rate::{rate, SENTINEL};

/// Last raw counter seen for a value and when it was read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
    pub value: i128,
    pub at: Instant,
}

/// One polled value of the target together with its output gauge.
struct PolledValue {
    name: String,
    oid: String,
    gauge: Gauge,
}

/// Polling loop for a single target.
///
/// Each value is either unprimed (no baseline) or primed (baseline held). A
/// cycle primes what is unprimed, sleeps for the interval, then samples every
/// primed value and publishes its rate. A failed query publishes the sentinel
/// and drops the baseline, so the value is primed again next cycle.
///
/// Cancellation is observed only at the top of a cycle; an in-flight sleep or
/// query always completes first.
pub struct Worker<Q> {
    target: Arc<TargetSpec>,
    client: Arc<Q>,
    values: Vec<PolledValue>,
    baselines: HashMap<String, Baseline>,
    stats: SampleStats,
}

impl<Q: QueryClient> Worker<Q> {
    /// Creates a worker publishing into `gauges`, keyed by value-name.
    ///
    /// Values of the target without a gauge are not polled.
    pub fn new(
        target: Arc<TargetSpec>,
        client: Arc<Q>,
        mut gauges: BTreeMap<String, Gauge>,
        stats: SampleStats,
    ) -> Self {
        let values = target
            .oids
            .iter()
            .filter_map(|(name, oid)| {
                gauges.remove(name).map(|gauge| PolledValue {
                    name: name.clone(),
                    oid: oid.clone(),
                    gauge,
                })
            })
            .collect();

        Self {
            target,
            client,
            values,
            baselines: HashMap::new(),
            stats,
        }
    }

    /// Runs the loop on the tokio runtime until `cancel` is observed.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let key = self.target.key();
        let interval = self.target.interval;
        info!(
            device = %key,
            interval_secs = interval.as_secs(),
            values = self.values.len(),
            "worker started",
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let cycle_start = Instant::now();
            self.prime(cycle_start).await;

            tokio::time::sleep(interval).await;

            let elapsed = cycle_start.elapsed();
            self.sample(elapsed).await;
        }

        info!(device = %key, "worker stopped");
    }

    /// Takes a baseline for every unprimed value.
    async fn prime(&mut self, at: Instant) {
        let target = &self.target;
        for value in &self.values {
            if self.baselines.contains_key(&value.name) {
                continue;
            }

            match self
                .client
                .get(&target.address, &target.community, &value.oid)
                .await
            {
                Ok(raw) => {
                    self.stats.success.inc();
                    self.baselines
                        .insert(value.name.clone(), Baseline { value: raw, at });
                    trace!(device = %target.name, value = %value.name, raw = %raw, "primed");
                }
                Err(e) => {
                    self.stats.failure.inc();
                    value.gauge.set(SENTINEL);
                    debug!(
                        device = %target.name,
                        address = %target.address,
                        value = %value.name,
                        error = %e,
                        "priming query failed",
                    );
                }
            }
        }
    }

    /// Samples every primed value and publishes its rate over `elapsed`.
    async fn sample(&mut self, elapsed: Duration) {
        let target = &self.target;
        for value in &self.values {
            let Some(prev) = self.baselines.get(&value.name).copied() else {
                continue;
            };

            match self
                .client
                .get(&target.address, &target.community, &value.oid)
                .await
            {
                Ok(raw) => {
                    self.stats.success.inc();
                    let current = rate(prev.value, raw, elapsed);
                    value.gauge.set(current);
                    self.baselines.insert(
                        value.name.clone(),
                        Baseline {
                            value: raw,
                            at: Instant::now(),
                        },
                    );

                    if raw < prev.value {
                        debug!(
                            device = %target.name,
                            value = %value.name,
                            prev = %prev.value,
                            raw = %raw,
                            "counter decreased, publishing negative rate",
                        );
                    }
                    trace!(
                        device = %target.name,
                        value = %value.name,
                        rate = current,
                        since_baseline_ms = prev.at.elapsed().as_millis() as u64,
                        "sampled",
                    );
                }
                Err(e) => {
                    self.stats.failure.inc();
                    value.gauge.set(SENTINEL);
                    self.baselines.remove(&value.name);
                    debug!(
                        device = %target.name,
                        address = %target.address,
                        value = %value.name,
                        error = %e,
                        "sampling query failed, baseline dropped",
                    );
                }
            }
        }
    }

    #[cfg(test)]
    fn is_primed(&self, value_name: &str) -> bool {
        self.baselines.contains_key(value_name)
    }
}

#[cfg(test)]
mod tests {
    use prometheus::Opts;

    use super::rate::is_sentinel;
    use super::*;
    use crate::export::health::ExporterMetrics;
    use crate::query::scripted::ScriptedClient;

    const ADDR: &str = "10.0.0.1";

    fn target(interval: u64, oids: &[(&str, &str)]) -> Arc<TargetSpec> {
        Arc::new(TargetSpec {
            name: "r1".to_string(),
            address: ADDR.to_string(),
            community: "public".to_string(),
            interval: Duration::from_secs(interval),
            oids: oids
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn gauges(spec: &TargetSpec) -> BTreeMap<String, Gauge> {
        spec.oids
            .keys()
            .map(|name| {
                let gauge = Gauge::with_opts(Opts::new(spec.metric_name(name), "test"))
                    .expect("gauge");
                (name.clone(), gauge)
            })
            .collect()
    }

    fn assert_rate(gauge: &Gauge, expected: f64) {
        let got = gauge.get();
        assert!((got - expected).abs() < 1e-3, "rate={got}, expected {expected}");
    }

    fn worker(
        spec: &Arc<TargetSpec>,
        client: &Arc<ScriptedClient>,
    ) -> (Worker<ScriptedClient>, BTreeMap<String, Gauge>) {
        let metrics = ExporterMetrics::new(":0").expect("metrics");
        let gauges = gauges(spec);
        let worker = Worker::new(
            Arc::clone(spec),
            Arc::clone(client),
            gauges.clone(),
            metrics.sample_stats(),
        );
        (worker, gauges)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_published_after_one_interval() {
        let spec = target(10, &[("in", "X")]);
        let client = Arc::new(ScriptedClient::new());
        client.push(ADDR, "X", 1000);
        client.push(ADDR, "X", 1200);

        let (mut worker, gauges) = worker(&spec, &client);

        let t0 = Instant::now();
        worker.prime(t0).await;
        assert!(worker.is_primed("in"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        worker.sample(t0.elapsed()).await;

        assert_rate(&gauges["in"], 20.0);
        assert_eq!(worker.baselines["in"].value, 1200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_priming_publishes_sentinel_and_stays_unprimed() {
        let spec = target(10, &[("in", "X")]);
        let client = Arc::new(ScriptedClient::new());
        client.push_failure(ADDR, "X");
        client.push(ADDR, "X", 500);

        let (mut worker, gauges) = worker(&spec, &client);
        gauges["in"].set(7.0);

        worker.prime(Instant::now()).await;
        assert!(is_sentinel(gauges["in"].get()));
        assert!(!worker.is_primed("in"));

        // Unprimed values are not sampled.
        worker.sample(Duration::from_secs(10)).await;
        assert_eq!(client.calls(ADDR, "X"), 1);

        // The next cycle primes without publishing a rate.
        worker.prime(Instant::now()).await;
        assert!(worker.is_primed("in"));
        assert!(is_sentinel(gauges["in"].get()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_drops_baseline() {
        let spec = target(10, &[("in", "X")]);
        let client = Arc::new(ScriptedClient::new());
        client.push(ADDR, "X", 1000);
        client.push_failure(ADDR, "X");

        let (mut worker, gauges) = worker(&spec, &client);
        worker.prime(Instant::now()).await;
        worker.sample(Duration::from_secs(10)).await;

        assert!(is_sentinel(gauges["in"].get()));
        assert!(!worker.is_primed("in"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_reset_publishes_negative_rate() {
        let spec = target(10, &[("in", "X")]);
        let client = Arc::new(ScriptedClient::new());
        client.push(ADDR, "X", 5000);
        client.push(ADDR, "X", 1000);

        let (mut worker, gauges) = worker(&spec, &client);
        worker.prime(Instant::now()).await;
        worker.sample(Duration::from_secs(10)).await;

        assert_rate(&gauges["in"], -400.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_fail_independently() {
        let spec = target(10, &[("in", "A"), ("out", "B")]);
        let client = Arc::new(ScriptedClient::new());
        client.push(ADDR, "A", 0);
        client.push(ADDR, "A", 100);
        client.push_failure(ADDR, "B");

        let (mut worker, gauges) = worker(&spec, &client);
        worker.prime(Instant::now()).await;
        worker.sample(Duration::from_secs(10)).await;

        assert_rate(&gauges["in"], 10.0);
        assert!(is_sentinel(gauges["out"].get()));
        assert!(worker.is_primed("in"));
        assert!(!worker.is_primed("out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_without_gauge_are_not_polled() {
        let spec = target(10, &[("in", "A"), ("out", "B")]);
        let client = Arc::new(ScriptedClient::new());
        client.ramp(ADDR, "A", 0, 10);
        client.ramp(ADDR, "B", 0, 10);

        let metrics = ExporterMetrics::new(":0").expect("metrics");
        let mut only_in = gauges(&spec);
        only_in.remove("out");
        let mut worker = Worker::new(
            Arc::clone(&spec),
            Arc::clone(&client),
            only_in,
            metrics.sample_stats(),
        );

        worker.prime(Instant::now()).await;
        assert_eq!(client.calls(ADDR, "A"), 1);
        assert_eq!(client.calls(ADDR, "B"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_publishes_and_stops_on_cancel() {
        let spec = target(10, &[("in", "X")]);
        let client = Arc::new(ScriptedClient::new());
        client.ramp(ADDR, "X", 1000, 200);

        let (worker, gauges) = worker(&spec, &client);
        let cancel = CancellationToken::new();
        let handle = worker.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_rate(&gauges["in"], 20.0);

        let cancelled_at = Instant::now();
        cancel.cancel();
        handle.await.expect("worker exits cleanly");
        assert!(cancelled_at.elapsed() <= Duration::from_secs(10));
    }
}
