//! Simulator configuration
//!
//! Built once at startup and handed to every controller as `Arc<SimConfig>`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cloud profile used when building shoots for a provider
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfile {
    pub name: String,
    pub kubernetes_version: String,
}

impl CloudProfile {
    fn new(name: &str, kubernetes_version: &str) -> Self {
        Self {
            name: name.to_string(),
            kubernetes_version: kubernetes_version.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfig {
    /// Namespace holding Runtime, GardenerCluster and KCP Kyma objects
    pub kcp_namespace: String,
    /// Namespace in the Garden cluster holding Shoots
    pub garden_namespace: String,
    /// Namespace in the tenant cluster receiving the mirrored Kyma
    pub tenant_namespace: String,
    pub tenant_manifest_name: String,
    pub credential_validity_secs: u64,
    pub rotation_poll_interval_secs: u64,
    pub tenant_loop_interval_ms: u64,
    /// Provider type (aws, azure, gcp, openstack) to cloud profile
    pub cloud_profiles: BTreeMap<String, CloudProfile>,
}

impl Default for SimConfig {
    fn default() -> Self {
        let cloud_profiles = BTreeMap::from([
            ("aws".to_string(), CloudProfile::new("aws", "1.33")),
            ("azure".to_string(), CloudProfile::new("az", "1.33")),
            ("gcp".to_string(), CloudProfile::new("gcp", "1.33")),
            (
                "openstack".to_string(),
                CloudProfile::new("converged-cloud-kyma", "1.33"),
            ),
        ]);
        Self {
            kcp_namespace: "kcp-system".to_string(),
            garden_namespace: "garden-sim".to_string(),
            tenant_namespace: "kyma-system".to_string(),
            tenant_manifest_name: "default".to_string(),
            credential_validity_secs: 6 * 3600,
            rotation_poll_interval_secs: 5 * 60,
            tenant_loop_interval_ms: 1000,
            cloud_profiles,
        }
    }
}

impl SimConfig {
    /// Load from a YAML file, falling back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::ConfigError(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    Error::ConfigError(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("kcpNamespace", &self.kcp_namespace),
            ("gardenNamespace", &self.garden_namespace),
            ("tenantNamespace", &self.tenant_namespace),
            ("tenantManifestName", &self.tenant_manifest_name),
        ] {
            if value.is_empty() {
                return Err(Error::ConfigError(format!("{field} must not be empty")));
            }
        }
        if self.credential_validity_secs == 0
            || self.rotation_poll_interval_secs == 0
            || self.tenant_loop_interval_ms == 0
        {
            return Err(Error::ConfigError(
                "validity and interval settings must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credential_validity(&self) -> Duration {
        Duration::from_secs(self.credential_validity_secs)
    }

    pub fn rotation_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_poll_interval_secs)
    }

    pub fn tenant_loop_interval(&self) -> Duration {
        Duration::from_millis(self.tenant_loop_interval_ms)
    }

    pub fn cloud_profile(&self, provider: &str) -> Option<&CloudProfile> {
        self.cloud_profiles.get(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SimConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.credential_validity(), Duration::from_secs(21600));
        assert_eq!(config.rotation_poll_interval(), Duration::from_secs(300));
        assert!(config.cloud_profile("aws").is_some());
        assert!(config.cloud_profile("alicloud").is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: SimConfig = serde_yaml::from_str("kcpNamespace: kcp\n").unwrap();
        assert_eq!(config.kcp_namespace, "kcp");
        assert_eq!(config.tenant_namespace, "kyma-system");
        assert_eq!(config.cloud_profiles.len(), 4);
    }

    #[test]
    fn test_rejects_empty_namespace() {
        let config = SimConfig {
            garden_namespace: String::new(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }
}
