use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::export::health::ExporterMetrics;
use crate::manager::{ReconcileSummary, Reconciler};
use crate::query::QueryClient;
use crate::targets::store::ConfigStore;
use crate::targets::ConfigError;
use crate::watch::ReloadEvent;

/// Single consumer of reload requests.
///
/// Requests arriving within the debounce window of the first one are folded
/// into a single reload. The loop owns the reconciler, so reconciliations
/// never overlap.
pub struct ReloadLoop<Q> {
    store: Arc<ConfigStore>,
    reconciler: Reconciler<Q>,
    metrics: Arc<ExporterMetrics>,
    debounce: Duration,
}

impl<Q: QueryClient> ReloadLoop<Q> {
    pub fn new(
        store: Arc<ConfigStore>,
        reconciler: Reconciler<Q>,
        metrics: Arc<ExporterMetrics>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            metrics,
            debounce,
        }
    }

    /// Processes requests until the reconciler's token fires or every sender
    /// is dropped, then stops all workers. A reload in progress is cut short
    /// by the token.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ReloadEvent>) {
        let cancel = self.reconciler.cancel_token();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }

            let mut coalesced = 0usize;
            while rx.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!(?event, coalesced, "reload requested");

            // Failures are logged and counted inside reload().
            let _ = self.reload().await;
        }

        self.reconciler.shutdown().await;
        info!("reload loop stopped");
    }

    /// Re-reads the targets file and reconciles against it.
    ///
    /// A file that cannot be read or parsed leaves the running workers
    /// untouched.
    pub async fn reload(&mut self) -> Result<ReconcileSummary, ConfigError> {
        let state = match self.store.load() {
            Ok(state) => state,
            Err(e) => {
                self.metrics.record_reload(false);
                warn!(
                    path = %self.store.path().display(),
                    error = %e,
                    "reload failed, keeping current targets",
                );
                return Err(e);
            }
        };

        let summary = self.reconciler.reconcile(&state).await;
        self.metrics.record_reload(true);
        info!(
            added = summary.added,
            removed = summary.removed,
            unchanged = summary.unchanged,
            stale = summary.stale,
            "targets reconciled",
        );

        Ok(summary)
    }

    pub fn reconciler(&self) -> &Reconciler<Q> {
        &self.reconciler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::scripted::ScriptedClient;

    use tokio_util::sync::CancellationToken;

    const ONE_TARGET: &str = r#"
core:
  - name: r1
    ip: 10.0.0.1
    interval: 10
    oids:
      in: 1.3.6.1.2.1.2.2.1.10.1
"#;

    const TWO_TARGETS: &str = r#"
core:
  - name: r1
    ip: 10.0.0.1
    interval: 10
    oids:
      in: 1.3.6.1.2.1.2.2.1.10.1
  - name: r2
    ip: 10.0.0.2
    interval: 10
    oids:
      in: 1.3.6.1.2.1.2.2.1.10.1
"#;

    const SLOW_TARGET: &str = r#"
core:
  - name: slow
    ip: 10.0.0.9
    interval: 60
    oids:
      in: 1.3.6.1.2.1.2.2.1.10.1
"#;

    fn write(file: &tempfile::NamedTempFile, text: &str) {
        std::fs::write(file.path(), text).expect("write");
    }

    fn reload_loop(
        file: &tempfile::NamedTempFile,
        cancel: &CancellationToken,
    ) -> (ReloadLoop<ScriptedClient>, Arc<ExporterMetrics>) {
        let metrics = Arc::new(ExporterMetrics::new(":0").expect("metrics"));
        let reconciler = Reconciler::new(
            Arc::new(ScriptedClient::new()),
            Arc::clone(&metrics),
            cancel.clone(),
        );
        let store = Arc::new(ConfigStore::new(file.path()));
        let reload = ReloadLoop::new(
            store,
            reconciler,
            Arc::clone(&metrics),
            Duration::from_millis(500),
        );
        (reload, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_applies_file_contents() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        write(&file, ONE_TARGET);
        let (mut reload, metrics) = reload_loop(&file, &CancellationToken::new());

        let summary = reload.reload().await.expect("reload");
        assert_eq!(summary.added, 1);

        write(&file, TWO_TARGETS);
        let summary = reload.reload().await.expect("reload");
        assert_eq!(summary.added, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(reload.reconciler().len(), 2);
        assert_eq!(
            metrics.reloads_total.with_label_values(&["success"]).get(),
            2.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_file_keeps_workers() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        write(&file, TWO_TARGETS);
        let (mut reload, metrics) = reload_loop(&file, &CancellationToken::new());
        reload.reload().await.expect("reload");

        write(&file, "r1: [unclosed\n");
        assert!(reload.reload().await.is_err());
        assert_eq!(reload.reconciler().len(), 2);
        assert_eq!(
            metrics.reloads_total.with_label_values(&["failure"]).get(),
            1.0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_reloads_once() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        write(&file, ONE_TARGET);
        let cancel = CancellationToken::new();
        let (reload, metrics) = reload_loop(&file, &cancel);

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(reload.run(rx));

        for _ in 0..5 {
            tx.send(ReloadEvent::FileChanged).await.expect("send");
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            metrics.reloads_total.with_label_values(&["success"]).get(),
            1.0
        );
        assert_eq!(metrics.active_workers.get(), 1.0);

        cancel.cancel();
        task.await.expect("loop exits");
        assert_eq!(metrics.active_workers.get(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_removing_target_stops_promptly() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        write(&file, SLOW_TARGET);
        let cancel = CancellationToken::new();
        let (reload, metrics) = reload_loop(&file, &cancel);

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(reload.run(rx));
        tx.send(ReloadEvent::Signal).await.expect("send");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(metrics.active_workers.get(), 1.0);

        // Removing the 60s target blocks on its sleep until cancelled.
        write(&file, ONE_TARGET);
        tx.send(ReloadEvent::FileChanged).await.expect("send");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        cancel.cancel();
        task.await.expect("loop exits");

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(metrics.active_workers.get(), 0.0);
    }
}
