use std::ffi::{OsStr, OsString};
use std::path::Path;

use anyhow::{Context, Result};
use notify::{Event, EventHandler, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Why a reload was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadEvent {
    FileChanged,
    Signal,
}

/// Feeds reload requests into the reload loop's channel.
///
/// The targets file is watched through its parent directory so that editors
/// which replace the file by rename keep triggering reloads. SIGHUP requests a
/// reload as well.
pub struct ReloadWatcher {
    _watcher: RecommendedWatcher,
    signal_task: Option<JoinHandle<()>>,
}

impl ReloadWatcher {
    pub fn spawn(
        path: &Path,
        tx: mpsc::Sender<ReloadEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let file_name = path
            .file_name()
            .with_context(|| format!("{} does not name a file", path.display()))?
            .to_os_string();
        let dir = watch_dir(path);

        let forwarder = FileEventForwarder {
            file_name,
            tx: tx.clone(),
        };
        let mut watcher = RecommendedWatcher::new(forwarder, notify::Config::default())
            .context("creating file watcher")?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        info!(path = %path.display(), "watching targets file");

        Ok(Self {
            _watcher: watcher,
            signal_task: spawn_hangup_listener(tx, cancel),
        })
    }
}

impl Drop for ReloadWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
    }
}

/// Directory holding `path`, falling back to the working directory for bare
/// file names.
pub fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Reports whether a directory event touches the watched file.
pub fn is_relevant(event: &Event, file_name: &OsStr) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );

    kind_matches
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

struct FileEventForwarder {
    file_name: OsString,
    tx: mpsc::Sender<ReloadEvent>,
}

impl EventHandler for FileEventForwarder {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "file watcher error");
                return;
            }
        };

        if !is_relevant(&event, &self.file_name) {
            return;
        }

        match self.tx.try_send(ReloadEvent::FileChanged) {
            Ok(()) => trace!(kind = ?event.kind, "targets file changed"),
            // A reload is already queued and will read the latest contents.
            Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => debug!("reload loop gone, dropping file event"),
        }
    }
}

#[cfg(unix)]
fn spawn_hangup_listener(
    tx: mpsc::Sender<ReloadEvent>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGHUP handler, file events only");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                    info!("received SIGHUP, reloading targets");
                    if tx.send(ReloadEvent::Signal).await.is_err() {
                        return;
                    }
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_hangup_listener(
    _tx: mpsc::Sender<ReloadEvent>,
    _cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    None
}
