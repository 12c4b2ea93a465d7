//! HTTP client services use to claim and release their bus partition.
use plover_common::ChannelId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionRequest {
    pub service_id: String,
    pub service_name: String,
    pub topic: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub partition_index: i32,
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("coordinator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("coordinator returned status {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn request_partition(
        &self,
        service_id: &str,
        service_name: &str,
        topic: &str,
    ) -> Result<ChannelId, ClientError> {
        let url = format!("{}/v1/partitions", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&PartitionRequest {
                service_id: service_id.to_string(),
                service_name: service_name.to_string(),
                topic: topic.to_string(),
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        let body: PartitionResponse = response.json().await?;
        Ok(ChannelId(body.partition_index))
    }

    pub async fn release_partition(&self, service_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/v1/partitions/{service_id}", self.base_url);
        let response = self.http.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}
