use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Authority configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    // Client-facing HTTP/WebSocket bind address.
    pub bind_addr: SocketAddr,
    // Internal verify/push RPC bind address.
    pub rpc_bind: SocketAddr,
    // Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    // Instance identity; doubles as the token issuer.
    pub service_id: String,
    pub service_name: String,
    pub bearer_ttl: Duration,
    pub refresh_ttl: Duration,
    // Shared store address; empty keeps everything in-process.
    pub redis_addr: Option<String>,
    // Partition coordinator address; empty pins this instance to channel 0.
    pub coordinator_addr: Option<String>,
    // External registry agent address.
    pub registry_addr: Option<String>,
    pub bus_enabled: bool,
    pub bus_partitions: usize,
    pub push_topic: String,
}

#[derive(Debug, Deserialize)]
struct AuthorityConfigOverride {
    bind_addr: Option<String>,
    rpc_bind: Option<String>,
    metrics_bind: Option<String>,
    service_id: Option<String>,
    bearer_ttl_secs: Option<u64>,
    refresh_ttl_secs: Option<u64>,
    redis_addr: Option<String>,
    coordinator_addr: Option<String>,
    registry_addr: Option<String>,
    bus_enabled: Option<bool>,
    bus_partitions: Option<usize>,
    push_topic: Option<String>,
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

impl AuthorityConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("PLOVER_AUTH_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7500".to_string())
            .parse()
            .with_context(|| "parse PLOVER_AUTH_BIND")?;
        let rpc_bind = std::env::var("PLOVER_AUTH_RPC_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7501".to_string())
            .parse()
            .with_context(|| "parse PLOVER_AUTH_RPC_BIND")?;
        let metrics_bind = std::env::var("PLOVER_AUTH_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7502".to_string())
            .parse()
            .with_context(|| "parse PLOVER_AUTH_METRICS_BIND")?;
        let service_id = std::env::var("PLOVER_SERVICE_ID")
            .unwrap_or_else(|_| plover_common::service_id("authority"));
        let bearer_ttl = Duration::from_secs(
            std::env::var("PLOVER_AUTH_BEARER_TTL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .with_context(|| "parse PLOVER_AUTH_BEARER_TTL_SECS")?,
        );
        let refresh_ttl = Duration::from_secs(
            std::env::var("PLOVER_AUTH_REFRESH_TTL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .with_context(|| "parse PLOVER_AUTH_REFRESH_TTL_SECS")?,
        );
        let bus_enabled = std::env::var("PLOVER_BUS_ENABLED")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let bus_partitions = std::env::var("PLOVER_BUS_PARTITIONS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .with_context(|| "parse PLOVER_BUS_PARTITIONS")?;
        let push_topic =
            std::env::var("PLOVER_PUSH_TOPIC").unwrap_or_else(|_| "plover-push".to_string());

        Ok(Self {
            bind_addr,
            rpc_bind,
            metrics_bind,
            service_id,
            service_name: "authority".to_string(),
            bearer_ttl,
            refresh_ttl,
            redis_addr: optional("PLOVER_REDIS_ADDR"),
            coordinator_addr: optional("PLOVER_COORDINATOR_ADDR"),
            registry_addr: optional("PLOVER_REGISTRY_ADDR"),
            bus_enabled,
            bus_partitions,
            push_topic,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PLOVER_AUTH_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read PLOVER_AUTH_CONFIG: {path}"))?;
            let override_cfg: AuthorityConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse authority config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.rpc_bind {
                config.rpc_bind = value.parse().with_context(|| "parse rpc_bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.service_id {
                config.service_id = value;
            }
            if let Some(value) = override_cfg.bearer_ttl_secs {
                config.bearer_ttl = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.refresh_ttl_secs {
                config.refresh_ttl = Duration::from_secs(value);
            }
            if let Some(value) = override_cfg.redis_addr {
                config.redis_addr = Some(value).filter(|value| !value.is_empty());
            }
            if let Some(value) = override_cfg.coordinator_addr {
                config.coordinator_addr = Some(value).filter(|value| !value.is_empty());
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
            if let Some(value) = override_cfg.push_topic {
                config.push_topic = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_plover_env() {
        for (key, _) in env::vars() {
            if key.starts_with("PLOVER_") {
                env::remove_var(key);
            }
        }
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_plover_env();
        let config = AuthorityConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:7500");
        assert_eq!(config.bearer_ttl, Duration::from_secs(3600));
        assert_eq!(config.refresh_ttl, Duration::from_secs(86400));
        assert_eq!(config.push_topic, "plover-push");
        assert!(config.service_id.starts_with("authority-"));
        assert!(!config.bus_enabled);
        assert!(config.redis_addr.is_none());
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_plover_env();
        env::set_var("PLOVER_AUTH_BEARER_TTL_SECS", "60");
        env::set_var("PLOVER_REDIS_ADDR", "redis://127.0.0.1:6379");
        env::set_var("PLOVER_BUS_ENABLED", "true");

        let config = AuthorityConfig::from_env().expect("from_env");
        assert_eq!(config.bearer_ttl, Duration::from_secs(60));
        assert_eq!(
            config.redis_addr.as_deref(),
            Some("redis://127.0.0.1:6379")
        );
        assert!(config.bus_enabled);

        clear_plover_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_overrides_with_valid_yaml() {
        clear_plover_env();
        let tmpdir = TempDir::new().unwrap();
        let config_path = tmpdir.path().join("config.yml");
        std::fs::write(
            &config_path,
            r#"
bind_addr: "127.0.0.1:7555"
bearer_ttl_secs: 120
push_topic: "auth-push"
"#,
        )
        .unwrap();
        env::set_var("PLOVER_AUTH_CONFIG", config_path.to_str().unwrap());

        let config = AuthorityConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7555");
        assert_eq!(config.bearer_ttl, Duration::from_secs(120));
        assert_eq!(config.push_topic, "auth-push");

        clear_plover_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_ttl() {
        clear_plover_env();
        env::set_var("PLOVER_AUTH_BEARER_TTL_SECS", "not-a-number");
        assert!(AuthorityConfig::from_env().is_err());
        clear_plover_env();
    }
}
