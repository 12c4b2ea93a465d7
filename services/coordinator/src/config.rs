use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

// Coordinator configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    // HTTP bind address for the assignment API.
    pub bind_addr: SocketAddr,
    // Metrics HTTP bind address.
    pub metrics_bind: SocketAddr,
    // Instance identity; defaults to coordinator-<random-hex>.
    pub service_id: String,
    // Base path for assignment records in the coordination store.
    pub base_path: String,
    // Partition count handed to newly discovered topics on the local bus.
    pub bus_partitions: usize,
    // Shared coordination store mode instead of the local lock.
    pub clustered: bool,
    // External registry agent address; empty disables the failure sweep.
    pub registry_addr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CoordinatorConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    service_id: Option<String>,
    base_path: Option<String>,
    bus_partitions: Option<usize>,
    clustered: Option<bool>,
    registry_addr: Option<String>,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind_addr = std::env::var("PLOVER_COORD_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7400".to_string())
            .parse()
            .with_context(|| "parse PLOVER_COORD_BIND")?;
        let metrics_bind = std::env::var("PLOVER_COORD_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7401".to_string())
            .parse()
            .with_context(|| "parse PLOVER_COORD_METRICS_BIND")?;
        let service_id = std::env::var("PLOVER_SERVICE_ID")
            .unwrap_or_else(|_| plover_common::service_id("coordinator"));
        let base_path =
            std::env::var("PLOVER_COORD_BASE_PATH").unwrap_or_else(|_| "/plover".to_string());
        let bus_partitions = std::env::var("PLOVER_BUS_PARTITIONS")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .with_context(|| "parse PLOVER_BUS_PARTITIONS")?;
        let clustered = std::env::var("PLOVER_COORD_CLUSTERED")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let registry_addr = std::env::var("PLOVER_REGISTRY_ADDR")
            .ok()
            .filter(|value| !value.is_empty());

        Ok(Self {
            bind_addr,
            metrics_bind,
            service_id,
            base_path,
            bus_partitions,
            clustered,
            registry_addr,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("PLOVER_COORD_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read PLOVER_COORD_CONFIG: {path}"))?;
            let override_cfg: CoordinatorConfigOverride = serde_yaml::from_str(&contents)
                .with_context(|| "parse coordinator config yaml")?;
            if let Some(value) = override_cfg.bind_addr {
                config.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.service_id {
                config.service_id = value;
            }
            if let Some(value) = override_cfg.base_path {
                config.base_path = value;
            }
            if let Some(value) = override_cfg.bus_partitions {
                config.bus_partitions = value;
            }
            if let Some(value) = override_cfg.clustered {
                config.clustered = value;
            }
            if let Some(value) = override_cfg.registry_addr {
                config.registry_addr = Some(value).filter(|value| !value.is_empty());
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
        let config = CoordinatorConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:7400");
        assert_eq!(config.base_path, "/plover");
        assert_eq!(config.bus_partitions, 8);
        assert!(!config.clustered);
        assert!(config.registry_addr.is_none());
        assert!(config.service_id.starts_with("coordinator-"));
    }

    #[serial]
    #[test]
    fn from_env_respects_env_vars() {
        clear_plover_env();
        env::set_var("PLOVER_COORD_BIND", "127.0.0.1:9400");
        env::set_var("PLOVER_SERVICE_ID", "coordinator-test");
        env::set_var("PLOVER_COORD_CLUSTERED", "true");
        env::set_var("PLOVER_REGISTRY_ADDR", "http://127.0.0.1:8500");

        let config = CoordinatorConfig::from_env().expect("from_env");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:9400");
        assert_eq!(config.service_id, "coordinator-test");
        assert!(config.clustered);
        assert_eq!(
            config.registry_addr.as_deref(),
            Some("http://127.0.0.1:8500")
        );

        clear_plover_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_invalid_socket_addr() {
        clear_plover_env();
        env::set_var("PLOVER_COORD_BIND", "not-a-valid-address");
        assert!(CoordinatorConfig::from_env().is_err());
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
bind_addr: "127.0.0.1:7444"
base_path: "/coord"
bus_partitions: 16
"#,
        )
        .unwrap();
        env::set_var("PLOVER_COORD_CONFIG", config_path.to_str().unwrap());

        let config = CoordinatorConfig::from_env_or_yaml().expect("from_env_or_yaml");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:7444");
        assert_eq!(config.base_path, "/coord");
        assert_eq!(config.bus_partitions, 16);

        clear_plover_env();
    }

    #[serial]
    #[test]
    fn from_env_or_yaml_missing_file_fails() {
        clear_plover_env();
        env::set_var("PLOVER_COORD_CONFIG", "/nonexistent/config.yml");
        assert!(CoordinatorConfig::from_env_or_yaml().is_err());
        clear_plover_env();
    }
}
