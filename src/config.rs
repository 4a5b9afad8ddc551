//! Operator configuration
//!
//! Optional YAML file merged under the CLI flags. Every section defaults,
//! so an empty file (or none at all) is a valid configuration.
//!
//! ```yaml
//! discovery:
//!   cacheTtl: 30
//! retry:
//!   maxAttempts: 5
//! classes:
//!   rbd-mirror:
//!     provisioner: rbd.csi.ceph.com
//!     parameters:
//!       mirroringMode: snapshot
//! ```

use crate::controlplane::discovery::DiscoveryConfig;
use crate::controlplane::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::domain::Backend;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// A named replication class: the provisioner it targets plus backend parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationClassConfig {
    /// CSI provisioner, used to pick the backend
    pub provisioner: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl ReplicationClassConfig {
    pub fn backend(&self) -> Option<Backend> {
        Backend::from_provisioner(&self.provisioner)
    }
}

/// Reconcile loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Requeue interval after a successful pass
    pub resync_secs: u64,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_secs: 300,
            namespace: None,
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(if self.resync_secs == 0 { 300 } else { self.resync_secs })
    }
}

/// Complete operator configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    pub discovery: DiscoveryConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub controller: ControllerConfig,
    pub classes: BTreeMap<String, ReplicationClassConfig>,
}

impl OperatorConfig {
    /// Parse from YAML
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)?;
        info!(
            "Loaded configuration from {} ({} replication classes)",
            path.display(),
            config.classes.len()
        );
        Ok(config)
    }

    /// Every class must name a provisioner the operator can route
    pub fn validate(&self) -> Result<()> {
        for (name, class) in &self.classes {
            if class.backend().is_none() {
                return Err(Error::Configuration(format!(
                    "class {} uses unknown provisioner {:?}",
                    name, class.provisioner
                )));
            }
        }
        Ok(())
    }
}
