//! Registry entities as the checker sees them, and the change events the
//! registry publishes about them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct HealthCheckSpec {
    pub ttl_sec: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Instance {
    pub id: String,
    pub service: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(default)]
    pub isolated: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Client {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

fn default_weight() -> u32 {
    100
}

fn default_healthy() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    InstanceUpserted { instance: Instance },
    InstanceDeleted { id: String },
    ClientUpserted { client: Client },
    ClientDeleted { id: String },
}

impl Instance {
    #[cfg(test)]
    pub fn example(id: &str, ttl_sec: u32) -> Self {
        Self {
            id: id.to_string(),
            service: "orders".to_string(),
            host: "10.1.0.7".to_string(),
            port: 8080,
            weight: 100,
            healthy: true,
            isolated: false,
            health_check: Some(HealthCheckSpec { ttl_sec }),
        }
    }

    /// A member of the checker fleet listening for peers on `host:port`.
    #[cfg(test)]
    pub fn fleet_member(service: &str, host: &str, port: u16) -> Self {
        Self {
            id: format!("{host}:{port}"),
            service: service.to_string(),
            host: host.to_string(),
            port,
            weight: 100,
            healthy: true,
            isolated: false,
            health_check: None,
        }
    }
}
