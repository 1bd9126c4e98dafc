use std::collections::HashMap;

use prometheus::{Gauge, Opts, Registry};
use tracing::{debug, warn};

struct Entry {
    gauge: Gauge,
    help: String,
    owners: usize,
}

/// Per-target rate gauges, keyed by metric name.
///
/// Acquiring an existing name is idempotent and returns the gauge registered
/// first. A gauge is unregistered once its last owner releases it.
pub struct GaugeRegistry {
    registry: Registry,
    entries: HashMap<String, Entry>,
    registrations: u64,
}

impl GaugeRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            entries: HashMap::new(),
            registrations: 0,
        }
    }

    /// Returns the gauge for `name`, registering it on first use.
    pub fn acquire(&mut self, name: &str, help: &str) -> prometheus::Result<Gauge> {
        if let Some(entry) = self.entries.get_mut(name) {
            if entry.help != help {
                warn!(
                    metric = name,
                    registered = %entry.help,
                    requested = help,
                    "metric already registered with different help, keeping the first",
                );
            }
            entry.owners += 1;
            return Ok(entry.gauge.clone());
        }

        let gauge = Gauge::with_opts(Opts::new(name, help))?;
        self.registry.register(Box::new(gauge.clone()))?;
        self.registrations += 1;
        debug!(metric = name, "registered gauge");

        self.entries.insert(
            name.to_string(),
            Entry {
                gauge: gauge.clone(),
                help: help.to_string(),
                owners: 1,
            },
        );

        Ok(gauge)
    }

    /// Drops one ownership of `name`. Returns true when the gauge was unregistered.
    pub fn release(&mut self, name: &str) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };

        entry.owners = entry.owners.saturating_sub(1);
        if entry.owners > 0 {
            return false;
        }

        if let Some(entry) = self.entries.remove(name) {
            if let Err(e) = self.registry.unregister(Box::new(entry.gauge)) {
                warn!(metric = name, error = %e, "unregistering gauge");
            }
            debug!(metric = name, "unregistered gauge");
        }

        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of gauges currently registered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total registrations performed against the underlying registry.
    pub fn registrations(&self) -> u64 {
        self.registrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered_names(registry: &Registry) -> Vec<String> {
        registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect()
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let registry = Registry::new();
        let mut gauges = GaugeRegistry::new(registry.clone());

        let a = gauges.acquire("r1_router_10_0_0_1_in", "help").expect("first");
        let b = gauges.acquire("r1_router_10_0_0_1_in", "help").expect("second");
        a.set(5.0);

        assert_eq!(b.get(), 5.0);
        assert_eq!(gauges.len(), 1);
        assert_eq!(gauges.registrations(), 1);
        assert_eq!(gathered_names(&registry), vec!["r1_router_10_0_0_1_in"]);
    }

    #[test]
    fn test_conflicting_help_keeps_first() {
        let mut gauges = GaugeRegistry::new(Registry::new());
        gauges.acquire("m", "first").expect("first");
        gauges.acquire("m", "second").expect("second");
        assert_eq!(gauges.registrations(), 1);
        assert_eq!(gauges.entries["m"].help, "first");
    }

    #[test]
    fn test_release_unregisters_after_last_owner() {
        let registry = Registry::new();
        let mut gauges = GaugeRegistry::new(registry.clone());
        gauges.acquire("m", "h").expect("acquire");
        gauges.acquire("m", "h").expect("acquire");

        assert!(!gauges.release("m"));
        assert!(gauges.contains("m"));
        assert!(gauges.release("m"));
        assert!(!gauges.contains("m"));
        assert!(gathered_names(&registry).is_empty());
        assert!(!gauges.release("m"));
    }

    #[test]
    fn test_reacquire_after_release_registers_again() {
        let mut gauges = GaugeRegistry::new(Registry::new());
        gauges.acquire("m", "h").expect("acquire");
        gauges.release("m");
        gauges.acquire("m", "h").expect("acquire again");
        assert_eq!(gauges.registrations(), 2);
    }

    #[test]
    fn test_name_taken_by_another_collector_is_error() {
        let registry = Registry::new();
        let other = Gauge::with_opts(Opts::new("m", "h")).expect("gauge");
        registry.register(Box::new(other)).expect("register");

        let mut gauges = GaugeRegistry::new(registry);
        assert!(gauges.acquire("m", "h").is_err());
        assert!(gauges.is_empty());
    }

    #[test]
    fn test_invalid_name_is_error() {
        let mut gauges = GaugeRegistry::new(Registry::new());
        assert!(gauges.acquire("bad-name", "h").is_err());
    }
}
