use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{ConfigError, DesiredState};

/// Holds the desired state loaded from the targets document.
///
/// The state is swapped as a whole; readers holding the previous `Arc`
/// keep seeing a consistent snapshot.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<DesiredState>>,
}

impl ConfigStore {
    /// Creates a store for `path` with an empty desired state.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(DesiredState::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the desired state currently in effect.
    #[cfg(test)]
    pub fn current(&self) -> Arc<DesiredState> {
        Arc::clone(&self.current.read())
    }

    /// Reads and parses the document, replacing the current state on success.
    ///
    /// On failure the previous state stays in effect. Rejected targets are
    /// logged and left out of the new state.
    pub fn load(&self) -> Result<Arc<DesiredState>, ConfigError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        let (state, rejected) = DesiredState::parse(&text)?;
        for e in &rejected {
            warn!(error = %e, "skipping target");
        }

        let state = Arc::new(state);
        *self.current.write() = Arc::clone(&state);

        debug!(
            path = %self.path.display(),
            targets = state.len(),
            rejected = rejected.len(),
            "config loaded",
        );

        Ok(state)
    }
}
