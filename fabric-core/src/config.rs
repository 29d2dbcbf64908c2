//! Fabric configuration loaded from YAML.
//!
//! ```yaml
//! runtime:
//!   worker_pool_size: 16
//!   long_poll_max_ms: 60000
//! communication:
//!   base: { resilient: true }
//!   services:
//!     billing: { settings: { run_in_place: false } }
//! services:
//!   - name: billing
//!     category: local
//!     commands: [Debit]
//!     queries: [Balance]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::fabric_memory::DEFAULT_WORKERS;
use crate::registry::{ServiceDefinition, ServiceRegistry};
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::settings::CommunicationOverrides;
use crate::types::{PrimitiveKind, ServiceCategory};

// ---------------------------------------------------------------------------
// FabricConfig
// ---------------------------------------------------------------------------

/// Root configuration. `FabricConfig::default()` runs everything in-process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    pub runtime: RuntimeConfig,
    pub communication: CommunicationOverrides,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Messages handled concurrently by the in-memory fabric.
    pub worker_pool_size: usize,
    /// Cap on any single long-poll wait.
    pub long_poll_max_ms: u64,
    pub poll_interval_ms: u64,
    /// Re-runs of a transition whose state save lost an ETag race.
    pub conflict_retry_limit: u32,
    /// Lifetime of terminal results. Unset keeps them forever.
    pub result_ttl_secs: Option<u64>,
    pub dispatch_retry: RetryConfig,
    pub redelivery: RetryConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKERS,
            long_poll_max_ms: 60_000,
            poll_interval_ms: 250,
            conflict_retry_limit: 8,
            result_ttl_secs: None,
            dispatch_retry: RetryConfig::from(RetryPolicy::interactive()),
            redelivery: RetryConfig::from(RetryPolicy::background()),
        }
    }
}

impl RuntimeConfig {
    pub fn long_poll_max(&self) -> Duration {
        Duration::from_millis(self.long_poll_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_ttl(&self) -> Option<Duration> {
        self.result_ttl_secs.map(Duration::from_secs)
    }
}

/// Serialized form of a [`RetryPolicy`]. `max_attempts` unset retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub first_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            first_ms: policy.backoff.first.as_millis() as u64,
            max_ms: policy.backoff.max.as_millis() as u64,
            factor: policy.backoff.factor,
            max_attempts: policy.max_attempts,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.first_ms),
                max: Duration::from_millis(self.max_ms),
                factor: self.factor,
            },
            max_attempts: self.max_attempts,
        }
    }
}

/// One service definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: ServiceCategory,
    /// Communicator that reaches this service. Required for external services.
    #[serde(default)]
    pub communicator: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

fn default_category() -> ServiceCategory {
    ServiceCategory::Local
}

impl ServiceConfig {
    pub fn definition(&self) -> Result<ServiceDefinition> {
        let mut definition = match (self.category, &self.communicator) {
            (ServiceCategory::Local, _) => ServiceDefinition {
                communicator: self.communicator.clone(),
                ..ServiceDefinition::local(&self.name)
            },
            (ServiceCategory::External, Some(c)) => ServiceDefinition::external(&self.name, c),
            (ServiceCategory::External, None) => anyhow::bail!(
                "external service '{}' has no communicator",
                self.name
            ),
        };
        let kinds = [
            (&self.queries, PrimitiveKind::Query),
            (&self.commands, PrimitiveKind::Command),
            (&self.events, PrimitiveKind::Event),
        ];
        for (names, kind) in kinds {
            for name in names {
                definition = definition.with_method(name, kind);
            }
        }
        Ok(definition)
    }
}

impl FabricConfig {
    /// Parse from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Parsing fabric configuration")
    }

    /// Load from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))
    }

    /// Build the service registry described by `services`.
    pub fn service_registry(&self) -> Result<ServiceRegistry> {
        let mut registry = ServiceRegistry::new();
        for service in &self.services {
            registry
                .define(service.definition()?)
                .with_context(|| format!("Defining service '{}'", service.name))?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MethodId, ServiceId};
    use std::io::Write;

    const SAMPLE: &str = r#"
runtime:
  worker_pool_size: 4
  long_poll_max_ms: 5000
  result_ttl_secs: 3600
  redelivery: { first_ms: 10, max_ms: 1000, factor: 3.0, max_attempts: 7 }
communication:
  base: { resilient: true }
  services:
    billing:
      settings: { run_in_place: false }
services:
  - name: billing
    commands: [Debit]
    queries: [Balance]
    events: [Debited]
  - name: ledger
    category: external
    communicator: http
    commands: [Post]
"#;

    #[test]
    fn default_config_is_in_process() {
        let config = FabricConfig::default();
        assert!(config.services.is_empty());
        assert_eq!(config.runtime.long_poll_max(), Duration::from_secs(60));
        assert_eq!(config.runtime.redelivery.policy(), RetryPolicy::background());
        assert_eq!(config.runtime.dispatch_retry.policy(), RetryPolicy::interactive());
    }

    #[test]
    fn parses_runtime_and_services() {
        let config = FabricConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.runtime.worker_pool_size, 4);
        assert_eq!(config.runtime.poll_interval_ms, 250);
        assert_eq!(config.runtime.result_ttl(), Some(Duration::from_secs(3600)));
        assert_eq!(config.runtime.redelivery.policy().max_attempts, Some(7));

        let registry = config.service_registry().unwrap();
        let billing = ServiceId::new("billing");
        assert_eq!(registry.category(&billing).unwrap(), ServiceCategory::Local);
        assert_eq!(
            registry.kind_of(&billing, &MethodId::new("Balance")).unwrap(),
            PrimitiveKind::Query
        );
        let ledger = registry.get(&ServiceId::new("ledger")).unwrap();
        assert_eq!(ledger.category, ServiceCategory::External);
        assert_eq!(ledger.communicator.as_deref(), Some("http"));
    }

    #[test]
    fn external_service_needs_a_communicator() {
        let config = FabricConfig::from_yaml_str(
            "services:\n  - name: ledger\n    category: external\n",
        )
        .unwrap();
        let err = config.service_registry().unwrap_err();
        assert!(err.to_string().contains("ledger"));
    }

    #[test]
    fn load_from_file_reports_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = FabricConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.services.len(), 2);

        let missing = file.path().with_extension("missing");
        let err = FabricConfig::load_from_file(&missing).unwrap_err();
        assert!(format!("{err:#}").contains("Reading"));
    }
}
