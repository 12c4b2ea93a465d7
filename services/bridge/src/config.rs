use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Bridge configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub service_id: String,
    pub service_name: String,
    // Relay topic this bridge consumes one partition of.
    pub relay_topic: String,
    // Authority push topic used in unified mode.
    pub push_topic: String,
    // Route replies through the authority's per-user channel.
    pub unified_push: bool,
    pub redis_addr: Option<String>,
    pub coordinator_addr: Option<String>,
    // Authority RPC base URL; enables remote token verification and pushes.
    pub authority_addr: Option<String>,
    pub registry_addr: Option<String>,
    pub bus_enabled: bool,
    pub bus_partitions: usize,
}

#[derive(Debug, Deserialize)]
struct BridgeConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    service_id: Option<String>,
    relay_topic: Option<String>,
    push_topic: Option<String>,
    unified_push: Option<bool>,
    redis_addr: Option<String>,
    coordinator_addr: Option<String>,
    authority_addr: Option<String>,
    registry_addr: Option<String>,
    bus_enabled: Option<bool>,
    bus_partitions: Option<usize>,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("PLOVER_BRIDGE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7600".to_string())
            .parse()
            .with_context(|| "parse PLOVER_BRIDGE_BIND")?;
        let metrics_bind = std::env::var("PLOVER_BRIDGE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7601".to_string())
            .parse()
            .with_context(|| "parse PLOVER_BRIDGE_METRICS_BIND")?;
        let service_id = std::env::var("PLOVER_SERVICE_ID")
            .unwrap_or_else(|_| plover_common::service_id("bridge"));
        let relay_topic =
            std::env::var("PLOVER_RELAY_TOPIC").unwrap_or_else(|_| "plover-relay".to_string());
        let push_topic =
            std::env::var("PLOVER_PUSH_TOPIC").unwrap_or_else(|_| "plover-push".to_string());
        let bus_partitions = std::env::var("PLOVER_BUS_PARTITIONS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .with_context(|| "parse PLOVER_BUS_PARTITIONS")?;

        Ok(Self {
            bind_addr,
            metrics_bind,
            service_id,
            service_name: "bridge".to_string(),
            relay_topic,
            push_topic,
            unified_push: flag("PLOVER_UNIFIED_PUSH"),
            redis_addr: optional("PLOVER_REDIS_ADDR"),
            coordinator_addr: optional("PLOVER_COORDINATOR_ADDR"),
            authority_addr: optional("PLOVER_AUTHORITY_ADDR"),
            registry_addr: optional("PLOVER_REGISTRY_ADDR"),
            bus_enabled: flag("PLOVER_BUS_ENABLED"),
            bus_partitions,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PLOVER_BRIDGE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read PLOVER_BRIDGE_CONFIG: {path}"))?;
            let override_cfg: BridgeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse bridge config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.service_id {
                config.service_id = value;
            }
            if let Some(value) = override_cfg.relay_topic {
                config.relay_topic = value;
            }
            if let Some(value) = override_cfg.push_topic {
                config.push_topic = value;
            }
            if let Some(value) = override_cfg.unified_push {
                config.unified_push = value;
            }
            if let Some(value) = override_cfg.redis_addr {
                config.redis_addr = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.coordinator_addr {
                config.coordinator_addr = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.authority_addr {
                config.authority_addr = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.registry_addr {
                config.registry_addr = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.bus_enabled {
                config.bus_enabled = value;
            }
            if let Some(value) = override_cfg.bus_partitions {
                config.bus_partitions = value;
            }
        }
        Ok(config)
    }
}
