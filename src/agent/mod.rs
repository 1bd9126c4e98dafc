pub mod reload;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ExporterConfig;
use crate::export::health::ExporterMetrics;
use crate::manager::Reconciler;
use crate::query::v2c::SnmpClient;
use crate::targets::store::ConfigStore;
use crate::watch::ReloadWatcher;

use self::reload::ReloadLoop;

/// Pending reload requests. Further file events are dropped while full.
const RELOAD_QUEUE_DEPTH: usize = 4;

/// Agent wires the components together: metrics server, targets store,
/// reconciler with its workers, reload loop and file watcher.
pub struct Agent {
    cfg: ExporterConfig,
    metrics: Arc<ExporterMetrics>,
    store: Arc<ConfigStore>,
    watcher: Option<ReloadWatcher>,
    reload_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    pub fn new(cfg: ExporterConfig) -> Result<Self> {
        let metrics = Arc::new(
            ExporterMetrics::new(&cfg.listen_addr).context("creating exporter metrics")?,
        );
        let store = Arc::new(ConfigStore::new(&cfg.targets_path));

        Ok(Self {
            cfg,
            metrics,
            store,
            watcher: None,
            reload_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components. The first targets load must succeed.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Metrics endpoint first so probes respond during startup.
        self.metrics
            .start()
            .await
            .context("starting metrics server")?;

        // 1. Initial targets.
        let state = self.store.load().with_context(|| {
            format!("loading targets from {}", self.cfg.targets_path.display())
        })?;
        info!(targets = state.len(), "loaded targets");

        // 2. Workers for the initial targets.
        let client = Arc::new(SnmpClient::new(self.cfg.snmp_timeout));
        let mut reconciler =
            Reconciler::new(client, Arc::clone(&self.metrics), self.cancel.child_token());
        let summary = reconciler.reconcile(&state).await;
        info!(workers = summary.added, "initial workers started");

        // 3. Reload loop, fed by the watcher.
        let (tx, rx) = mpsc::channel(RELOAD_QUEUE_DEPTH);
        let reload = ReloadLoop::new(
            Arc::clone(&self.store),
            reconciler,
            Arc::clone(&self.metrics),
            self.cfg.reload_debounce,
        );
        self.reload_task = Some(tokio::spawn(reload.run(rx)));

        self.watcher = Some(
            ReloadWatcher::spawn(&self.cfg.targets_path, tx, self.cancel.child_token())
                .context("starting targets watcher")?,
        );

        info!("agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // No further reload requests.
        self.watcher = None;

        // The reload loop stops every worker before it exits.
        if let Some(task) = self.reload_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "reload loop ended abnormally");
            }
        }

        self.metrics.stop().await?;

        Ok(())
    }
}
