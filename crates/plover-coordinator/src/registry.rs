//! Service registry integration for liveness checks.
//!
//! The failure sweep asks the registry which instances of a service name are
//! passing their health checks; anything recorded but not reported live is a
//! candidate for release. The HTTP implementation speaks the Consul agent
//! API; the static implementation backs tests and single-binary runs.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Instance ids of `service_name` currently passing health checks.
    async fn live_instances(&self, service_name: &str) -> Result<Vec<String>, RegistryError>;
}

/// Consul-style agent client.
#[derive(Clone)]
pub struct HttpRegistry {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HealthEntry {
    #[serde(rename = "Service")]
    service: HealthService,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct RegisterBody<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn register(
        &self,
        service_id: &str,
        service_name: &str,
        address: &str,
        port: u16,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        let response = self
            .http
            .put(url)
            .json(&RegisterBody {
                id: service_id,
                name: service_name,
                address,
                port,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(())
    }

    pub async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let url = format!(
            "{}/v1/agent/service/deregister/{service_id}",
            self.base_url
        );
        let response = self.http.put(url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for HttpRegistry {
    async fn live_instances(&self, service_name: &str) -> Result<Vec<String>, RegistryError> {
        let url = format!(
            "{}/v1/health/service/{service_name}?passing",
            self.base_url
        );
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }
        let entries: Vec<HealthEntry> = response.json().await?;
        Ok(entries.into_iter().map(|entry| entry.service.id).collect())
    }
}

/// Fixed in-memory registry for tests and busless single-node runs.
#[derive(Default)]
pub struct StaticRegistry {
    services: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service_name: &str, service_id: &str) {
        self.services
            .write()
            .expect("registry lock")
            .entry(service_name.to_string())
            .or_default()
            .insert(service_id.to_string());
    }

    pub fn remove(&self, service_name: &str, service_id: &str) {
        if let Some(ids) = self
            .services
            .write()
            .expect("registry lock")
            .get_mut(service_name)
        {
            ids.remove(service_id);
        }
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn live_instances(&self, service_name: &str) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .services
            .read()
            .expect("registry lock")
            .get(service_name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_registry_tracks_instances() {
        let registry = StaticRegistry::new();
        registry.add("bridge", "bridge-1");
        registry.add("bridge", "bridge-2");
        registry.remove("bridge", "bridge-1");

        let live = registry.live_instances("bridge").await.expect("live");
        assert_eq!(live, vec!["bridge-2".to_string()]);
        assert!(registry
            .live_instances("unknown")
            .await
            .expect("live")
            .is_empty());
    }
}
