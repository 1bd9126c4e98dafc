pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::query::v2c::parse_oid;

/// Community string used when a target does not set one.
pub const DEFAULT_COMMUNITY: &str = "public";

/// Polling interval in seconds used when a target does not set one.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Errors that reject a whole configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config document: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config document is empty")]
    Empty,
    #[error("config document must map section labels to lists of targets")]
    NotAMapping,
}

/// Position of a target object inside the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub section: String,
    pub index: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.section, self.index)
    }
}

/// Errors that reject a single target while the rest of the document applies.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("section `{section}` is not a list of targets")]
    NotASequence { section: String },
    #[error("{at}: {source}")]
    Malformed {
        at: Location,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{at}: missing required field `{field}`")]
    MissingField { at: Location, field: &'static str },
    #[error("{at}: `oids` must not be empty")]
    EmptyOids { at: Location },
    #[error("{at}: `interval` must be positive")]
    ZeroInterval { at: Location },
    #[error("{at}: oid `{value_name}` is not a dotted object identifier")]
    InvalidOid { at: Location, value_name: String },
    #[error("{at}: `{metric}` is not a valid metric name")]
    InvalidMetricName { at: Location, metric: String },
    #[error("{at}: duplicate target {key}, keeping the first definition")]
    Duplicate { at: Location, key: TargetKey },
}

/// Identity of a target across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetKey {
    pub name: String,
    pub address: String,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// One polled device. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub address: String,
    pub community: String,
    pub interval: Duration,
    /// Value-name to protocol identifier.
    pub oids: BTreeMap<String, String>,
}

impl TargetSpec {
    pub fn key(&self) -> TargetKey {
        TargetKey {
            name: self.name.clone(),
            address: self.address.clone(),
        }
    }

    /// Exposition name of the gauge carrying `value_name`'s rate.
    pub fn metric_name(&self, value_name: &str) -> String {
        metric_name(&self.name, &self.address, value_name)
    }

    /// Help text of the gauge carrying `value_name`'s rate.
    pub fn metric_help(&self, value_name: &str) -> String {
        format!("SNMP metric for {value_name} on {}", self.address)
    }
}

/// Builds `{name}_router_{address with dots as underscores}_{value_name}`.
pub fn metric_name(name: &str, address: &str, value_name: &str) -> String {
    format!("{name}_router_{}_{value_name}", address.replace('.', "_"))
}

/// Reports whether `name` is accepted by the Prometheus exposition format.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Target object as written in the document, before validation.
#[derive(Debug, Deserialize)]
struct RawTarget {
    name: Option<String>,
    #[serde(alias = "address")]
    ip: Option<String>,
    community: Option<String>,
    interval: Option<u64>,
    oids: Option<BTreeMap<String, Value>>,
}

/// The full target list of the latest successfully parsed document.
#[derive(Debug, Default, Clone)]
pub struct DesiredState {
    targets: BTreeMap<TargetKey, Arc<TargetSpec>>,
}

impl DesiredState {
    /// Builds a state from already validated specs. The first spec wins on duplicate keys.
    pub fn from_targets(specs: impl IntoIterator<Item = TargetSpec>) -> Self {
        let mut targets = BTreeMap::new();
        for spec in specs {
            targets.entry(spec.key()).or_insert_with(|| Arc::new(spec));
        }
        Self { targets }
    }

    /// Parses a configuration document.
    ///
    /// Document-level problems fail the whole parse. Problems confined to one
    /// target are returned alongside the state, and that target is left out.
    pub fn parse(text: &str) -> Result<(Self, Vec<TargetError>), ConfigError> {
        if text.trim().is_empty() {
            return Err(ConfigError::Empty);
        }

        let doc: Value = serde_yaml::from_str(text)?;
        let sections = match doc {
            Value::Null => return Err(ConfigError::Empty),
            Value::Mapping(m) => m,
            _ => return Err(ConfigError::NotAMapping),
        };

        let mut targets = BTreeMap::new();
        let mut rejected = Vec::new();

        for (label, entries) in sections {
            let section = section_label(&label);
            let entries = match entries {
                Value::Sequence(seq) => seq,
                Value::Null => continue,
                _ => {
                    rejected.push(TargetError::NotASequence { section });
                    continue;
                }
            };

            for (index, entry) in entries.into_iter().enumerate() {
                let at = Location {
                    section: section.clone(),
                    index,
                };
                let spec = match parse_target(entry, &at) {
                    Ok(spec) => spec,
                    Err(e) => {
                        rejected.push(e);
                        continue;
                    }
                };

                let key = spec.key();
                if targets.contains_key(&key) {
                    rejected.push(TargetError::Duplicate { at, key });
                    continue;
                }
                targets.insert(key, Arc::new(spec));
            }
        }

        Ok((Self { targets }, rejected))
    }

    pub fn get(&self, key: &TargetKey) -> Option<&Arc<TargetSpec>> {
        self.targets.get(key)
    }

    pub fn contains(&self, key: &TargetKey) -> bool {
        self.targets.contains_key(key)
    }

    pub fn targets(&self) -> impl Iterator<Item = &Arc<TargetSpec>> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

fn section_label(label: &Value) -> String {
    match label {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn parse_target(entry: Value, at: &Location) -> Result<TargetSpec, TargetError> {
    let raw: RawTarget = serde_yaml::from_value(entry).map_err(|source| TargetError::Malformed {
        at: at.clone(),
        source,
    })?;

    let name = raw
        .name
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TargetError::MissingField {
            at: at.clone(),
            field: "name",
        })?;
    let address = raw
        .ip
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TargetError::MissingField {
            at: at.clone(),
            field: "ip",
        })?;
    let raw_oids = raw.oids.ok_or_else(|| TargetError::MissingField {
        at: at.clone(),
        field: "oids",
    })?;
    if raw_oids.is_empty() {
        return Err(TargetError::EmptyOids { at: at.clone() });
    }

    let interval = raw.interval.unwrap_or(DEFAULT_INTERVAL_SECS);
    if interval == 0 {
        return Err(TargetError::ZeroInterval { at: at.clone() });
    }

    let mut oids = BTreeMap::new();
    for (value_name, oid) in raw_oids {
        let oid = match oid {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        if parse_oid(&oid).is_err() {
            return Err(TargetError::InvalidOid {
                at: at.clone(),
                value_name,
            });
        }

        let metric = metric_name(&name, &address, &value_name);
        if !is_valid_metric_name(&metric) {
            return Err(TargetError::InvalidMetricName {
                at: at.clone(),
                metric,
            });
        }
        oids.insert(value_name, oid);
    }

    Ok(TargetSpec {
        name,
        address,
        community: raw
            .community
            .unwrap_or_else(|| DEFAULT_COMMUNITY.to_string()),
        interval: Duration::from_secs(interval),
        oids,
    })
}
