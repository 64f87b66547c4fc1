//! Shoot construction from a Runtime
//!
//! Validation reports every problem at once, attributed to the offending
//! field, so the Runtime's error condition tells the user all they must fix.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use serde_json::json;

use crate::config::SimConfig;
use crate::crd::{
    Provider, Runtime, Shoot, ShootKubernetes, ShootNetworking, ShootProvider, ShootSpec,
    SpecValidationError,
};

const DEFAULT_NETWORKING_TYPE: &str = "calico";

#[cfg_attr(test, automock)]
pub trait ShootBuilder: Send + Sync {
    fn validate(&self, runtime: &Runtime) -> Result<(), Vec<SpecValidationError>>;

    /// Validate, then build the Shoot the Runtime asks for
    fn build(&self, runtime: &Runtime) -> Result<Shoot, Vec<SpecValidationError>>;
}

/// Builds Shoots from the configured cloud profiles
pub struct DefaultShootBuilder {
    config: Arc<SimConfig>,
}

impl DefaultShootBuilder {
    pub fn new(config: Arc<SimConfig>) -> Self {
        Self { config }
    }
}

/// An IPv4 network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    base: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: Ipv4Addr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        if prefix > 32 {
            return None;
        }
        let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
        Some(Self {
            base: u32::from(addr) & mask,
            prefix,
        })
    }

    /// Split into `2^bits` equal subnets, or `None` if the prefix overflows
    pub fn subnets(&self, bits: u8) -> Option<Vec<Ipv4Cidr>> {
        let prefix = self.prefix.checked_add(bits).filter(|p| *p <= 32)?;
        let step = 1u64 << (32 - prefix as u32);
        Some(
            (0..(1u64 << bits))
                .map(|i| Ipv4Cidr {
                    base: (self.base as u64 + i * step) as u32,
                    prefix,
                })
                .collect(),
        )
    }
}

impl std::fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.base), self.prefix)
    }
}

fn infrastructure_config(
    provider: Provider,
    nodes: Ipv4Cidr,
    zones: &[String],
) -> Option<serde_json::Value> {
    match provider {
        Provider::Aws => {
            let ranges = nodes.subnets(4)?;
            let zones: Vec<_> = zones
                .iter()
                .enumerate()
                .map(|(i, zone)| {
                    Some(json!({
                        "name": zone,
                        "internal": ranges.get(i * 3)?.to_string(),
                        "public": ranges.get(i * 3 + 1)?.to_string(),
                        "workers": ranges.get(i * 3 + 2)?.to_string(),
                    }))
                })
                .collect::<Option<_>>()?;
            Some(json!({
                "apiVersion": "aws.provider.extensions.gardener.cloud/v1alpha1",
                "kind": "InfrastructureConfig",
                "networks": { "vpc": { "cidr": nodes.to_string() }, "zones": zones },
            }))
        }
        Provider::Azure => {
            let ranges = nodes.subnets(2)?;
            let zones: Vec<_> = (0..zones.len())
                .map(|i| {
                    Some(json!({
                        "name": i + 1,
                        "cidr": ranges.get(i)?.to_string(),
                        "natGateway": { "enabled": true, "idleConnectionTimeoutMinutes": 4 },
                    }))
                })
                .collect::<Option<_>>()?;
            Some(json!({
                "apiVersion": "azure.provider.extensions.gardener.cloud/v1alpha1",
                "kind": "InfrastructureConfig",
                "networks": { "vnet": { "cidr": nodes.to_string() }, "zones": zones },
                "zoned": true,
            }))
        }
        Provider::Gcp => Some(json!({
            "apiVersion": "gcp.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig",
            "networks": { "workers": nodes.to_string() },
        })),
        Provider::Openstack => Some(json!({
            "apiVersion": "openstack.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "InfrastructureConfig",
            "networks": { "workers": nodes.to_string() },
        })),
    }
}

impl ShootBuilder for DefaultShootBuilder {
    fn validate(&self, runtime: &Runtime) -> Result<(), Vec<SpecValidationError>> {
        let shoot = &runtime.spec.shoot;
        let mut errors = Vec::new();

        let provider = match shoot.provider.type_.parse::<Provider>() {
            Ok(p) => Some(p),
            Err(e) => {
                errors.push(SpecValidationError::new(
                    "spec.shoot.provider.type",
                    e,
                    "Use one of aws, azure, gcp or openstack.",
                ));
                None
            }
        };
        if let Some(p) = provider {
            if self.config.cloud_profile(p.as_str()).is_none() {
                errors.push(SpecValidationError::new(
                    "spec.shoot.provider.type",
                    format!("no cloud profile configured for provider {p}"),
                    "Add the provider to cloudProfiles in the simulator config.",
                ));
            }
        }
        if shoot.name.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.shoot.name",
                "shoot name must be set",
                "Set spec.shoot.name.",
            ));
        }
        if self.config.garden_namespace.is_empty() {
            errors.push(SpecValidationError::new(
                "gardenNamespace",
                "garden namespace must be set",
                "Set gardenNamespace in the simulator config.",
            ));
        }
        if shoot.region.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.shoot.region",
                "region must be set",
                "Set spec.shoot.region.",
            ));
        }
        let nodes = Ipv4Cidr::parse(&shoot.networking.nodes);
        if nodes.is_none() {
            errors.push(SpecValidationError::new(
                "spec.shoot.networking.nodes",
                format!("{:?} is not an IPv4 CIDR", shoot.networking.nodes),
                "Use a range such as 10.250.0.0/16.",
            ));
        }
        let zones = shoot
            .provider
            .workers
            .first()
            .map(|w| w.zones.as_slice())
            .unwrap_or_default();
        if zones.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.shoot.provider.workers",
                "at least one worker with zones is required",
                "Add a worker pool listing its zones.",
            ));
        }
        if let (Some(p), Some(nodes)) = (provider, nodes) {
            if !zones.is_empty() && infrastructure_config(p, nodes, zones).is_none() {
                errors.push(SpecValidationError::new(
                    "spec.shoot.networking.nodes",
                    format!(
                        "{nodes} cannot be split into per-zone ranges for {} zones",
                        zones.len()
                    ),
                    "Use a larger nodes range or fewer zones.",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn build(&self, runtime: &Runtime) -> Result<Shoot, Vec<SpecValidationError>> {
        self.validate(runtime)?;
        let rt = &runtime.spec.shoot;
        let invalid = |field: &str| {
            vec![SpecValidationError::new(field, "invalid value", "Fix the field.")]
        };

        let provider: Provider = rt
            .provider
            .type_
            .parse()
            .map_err(|_| invalid("spec.shoot.provider.type"))?;
        let profile = self
            .config
            .cloud_profile(provider.as_str())
            .ok_or_else(|| invalid("spec.shoot.provider.type"))?;
        let nodes =
            Ipv4Cidr::parse(&rt.networking.nodes).ok_or_else(|| invalid("spec.shoot.networking.nodes"))?;
        let zones = rt
            .provider
            .workers
            .first()
            .map(|w| w.zones.as_slice())
            .unwrap_or_default();

        let mut shoot = Shoot::new(
            &rt.name,
            ShootSpec {
                cloud_profile_name: profile.name.clone(),
                kubernetes: ShootKubernetes {
                    version: rt
                        .kubernetes
                        .version
                        .clone()
                        .unwrap_or_else(|| profile.kubernetes_version.clone()),
                },
                networking: ShootNetworking {
                    type_: rt
                        .networking
                        .type_
                        .clone()
                        .unwrap_or_else(|| DEFAULT_NETWORKING_TYPE.to_string()),
                    nodes: rt.networking.nodes.clone(),
                    pods: rt.networking.pods.clone(),
                    services: rt.networking.services.clone(),
                },
                provider: ShootProvider {
                    type_: provider.to_string(),
                    workers: rt.provider.workers.clone(),
                    infrastructure_config: infrastructure_config(provider, nodes, zones),
                },
                region: rt.region.clone(),
                secret_binding_name: rt.secret_binding_name.clone(),
                purpose: (!rt.purpose.is_empty()).then(|| rt.purpose.clone()),
            },
        );
        shoot.metadata.namespace = Some(self.config.garden_namespace.clone());
        shoot.metadata.labels = Some(BTreeMap::from([(
            format!("extensions.extensions.gardener.cloud/{provider}"),
            "true".to_string(),
        )]));
        Ok(shoot)
    }
}
