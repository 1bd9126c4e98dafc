use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::export::health::{bind_address, DEFAULT_LISTEN_ADDR};

/// Default location of the targets document.
pub const DEFAULT_TARGETS_PATH: &str = "config.yaml";

/// Process-level settings of the exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// YAML document describing the polled targets.
    pub targets_path: PathBuf,

    /// Listen address of the metrics endpoint. Default: ":9080".
    pub listen_addr: String,

    /// Timeout of a single SNMP request. Default: 5s.
    pub snmp_timeout: Duration,

    /// Window in which file change events are folded into one reload. Default: 500ms.
    pub reload_debounce: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            targets_path: PathBuf::from(DEFAULT_TARGETS_PATH),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            snmp_timeout: default_snmp_timeout(),
            reload_debounce: default_reload_debounce(),
        }
    }
}

pub fn default_snmp_timeout() -> Duration {
    Duration::from_secs(5)
}

pub fn default_reload_debounce() -> Duration {
    Duration::from_millis(500)
}

impl ExporterConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.targets_path.as_os_str().is_empty() {
            bail!("targets path is required");
        }

        if self.targets_path.file_name().is_none() {
            bail!(
                "targets path {} does not name a file",
                self.targets_path.display()
            );
        }

        let bind = bind_address(&self.listen_addr);
        let port = bind.rsplit_once(':').map(|(_, port)| port);
        match port {
            Some(port) if port.parse::<u16>().is_ok() => {}
            _ => bail!("listen address {:?} must end in :port", self.listen_addr),
        }

        if self.snmp_timeout.is_zero() {
            bail!("snmp timeout must be positive");
        }

        Ok(())
    }
}
