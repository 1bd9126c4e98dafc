//! Polls SNMP counters from network devices on a per-target interval and
//! exposes the per-second rate of every counter as a Prometheus gauge.
//!
//! The set of targets comes from a YAML document that is reloaded when it
//! changes; workers are started and stopped to match it.

pub mod agent;
pub mod config;
pub mod export;
pub mod manager;
pub mod poller;
pub mod query;
pub mod targets;
pub mod watch;
