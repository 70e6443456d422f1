//! # lode-agent
//!
//! Control plane for the lode metrics agent. The agent scrapes samples into
//! a WAL and forwards them to remote sinks; this crate supervises that work
//! without looking inside it:
//!
//! - [`manager::InstanceManager`] owns the set of running instances, each
//!   driven by a supervisor task that restarts crashed instances after a
//!   backoff.
//! - [`cluster::ConfigWatcher`] implements the clustered scraping service:
//!   replicas partition a shared config store by consistent ownership and
//!   continuously reshard in response to membership changes.
//! - [`agent::Agent`] ties the two together and selects between single-node
//!   and clustered mode.
//!
//! The scrape engine itself sits behind the [`instance::Instance`] and
//! [`instance::InstanceFactory`] seams and is provided by the host binary;
//! [`instance::MockFactory`] scripts it for tests.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod instance;
pub mod manager;
pub mod metrics;

pub use agent::{Agent, AgentError};
pub use cluster::{ring_ownership, ConfigWatcher, OwnershipFn, ValidationFn, WatcherError};
pub use config::{AgentConfig, ConfigError, GlobalConfig, ScrapingServiceConfig};
pub use instance::{
    Instance, InstanceConfig, InstanceError, InstanceFactory, MockFactory, MockInstance,
};
pub use manager::{ApplyReport, InstanceManager, Manager, ManagerError};
pub use metrics::Metrics;
