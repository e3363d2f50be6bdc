//! reqwest-backed implementation of the Hyperstack API.
//!
//! A thin transport layer: no retry logic lives here (retries belong to the
//! driver, which knows which error classes are transient for which step).

use crate::api::{
    CreateEnvironmentRequest, CreateVirtualMachinesRequest, CreateVolumeRequest, Environment,
    HyperstackApi, ImportKeyPairRequest, KeyPair, PriceEntry, Volume,
};
use crate::error::{HyperstackError, Result};
use async_trait::async_trait;
use cirrus_cloud::hyperstack::{VirtualMachine, VolumeId};
use serde::Deserialize;
use serde::de::DeserializeOwned;

pub const DEFAULT_API_BASE: &str = "https://infrahub-api.nexgencloud.com/v1";

/// Connection settings for the Hyperstack API.
#[derive(Debug, Clone)]
pub struct HyperstackClientConfig {
    pub base_url: String,
    pub api_key: String,
}

impl HyperstackClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Read `HYPERSTACK_API_KEY` (required) and `HYPERSTACK_API_BASE`
    /// (optional) from the environment.
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("HYPERSTACK_API_KEY").map_err(|_| HyperstackError::MissingApiKey)?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("HYPERSTACK_API_BASE") {
            config.base_url = base_url;
        }
        Ok(config)
    }
}

/// HTTP client for the Hyperstack API.
pub struct HyperstackClient {
    http: reqwest::Client,
    config: HyperstackClientConfig,
}

/// Everything the API returns is wrapped in an envelope carrying `status`
/// and `message`; the payload key varies per endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    payload: T,
}

#[derive(Debug, Deserialize)]
struct VolumePayload {
    volume: Volume,
}

#[derive(Debug, Deserialize)]
struct InstancesPayload {
    instances: Vec<VirtualMachine>,
}

#[derive(Debug, Deserialize)]
struct InstancePayload {
    instance: VirtualMachine,
}

#[derive(Debug, Deserialize)]
struct EnvironmentsPayload {
    environments: Vec<Environment>,
}

#[derive(Debug, Deserialize)]
struct EnvironmentPayload {
    environment: Environment,
}

#[derive(Debug, Deserialize)]
struct KeyPairsPayload {
    keypairs: Vec<KeyPair>,
}

#[derive(Debug, Deserialize)]
struct KeyPairPayload {
    keypair: KeyPair,
}

#[derive(Debug, Default, Deserialize)]
struct EmptyPayload {}

impl HyperstackClient {
    pub fn new(config: HyperstackClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .header("api_key", &self.config.api_key)
            .header("accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or(body);
            return Err(HyperstackError::Api {
                status: Some(status.as_u16()),
                message,
            });
        }
        let envelope: Envelope<T> = serde_json::from_str(&body)?;
        if envelope.status == Some(false) {
            return Err(HyperstackError::Api {
                status: Some(status.as_u16()),
                message: envelope.message.unwrap_or_else(|| "unknown error".into()),
            });
        }
        Ok(envelope.payload)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        tracing::debug!(%path, "GET hyperstack");
        self.send(self.http.get(self.url(path))).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl serde::Serialize,
    ) -> Result<T> {
        tracing::debug!(%path, "POST hyperstack");
        self.send(self.http.post(self.url(path)).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        tracing::debug!(%path, "DELETE hyperstack");
        self.send::<EmptyPayload>(self.http.delete(self.url(path)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HyperstackApi for HyperstackClient {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        let payload: VolumePayload = self.post("/core/volumes", &request).await?;
        Ok(payload.volume)
    }

    async fn delete_volume(&self, id: VolumeId) -> Result<()> {
        self.delete(&format!("/core/volumes/{id}")).await
    }

    async fn attach_volumes(&self, vm_id: i64, volume_ids: Vec<VolumeId>) -> Result<()> {
        let body = serde_json::json!({ "volume_ids": volume_ids });
        self.send::<EmptyPayload>(
            self.http
                .post(self.url(&format!("/core/virtual-machines/{vm_id}/attach-volumes")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn create_virtual_machines(
        &self,
        request: CreateVirtualMachinesRequest,
    ) -> Result<Vec<VirtualMachine>> {
        let payload: InstancesPayload = self.post("/core/virtual-machines", &request).await?;
        Ok(payload.instances)
    }

    async fn delete_virtual_machine(&self, id: i64) -> Result<()> {
        self.delete(&format!("/core/virtual-machines/{id}")).await
    }

    async fn start_virtual_machine(&self, id: i64) -> Result<()> {
        self.get::<EmptyPayload>(&format!("/core/virtual-machines/{id}/start"))
            .await?;
        Ok(())
    }

    async fn hard_reboot_virtual_machine(&self, id: i64) -> Result<()> {
        self.get::<EmptyPayload>(&format!("/core/virtual-machines/{id}/hard-reboot"))
            .await?;
        Ok(())
    }

    async fn get_virtual_machine(&self, id: i64) -> Result<VirtualMachine> {
        let payload: InstancePayload = self.get(&format!("/core/virtual-machines/{id}")).await?;
        Ok(payload.instance)
    }

    async fn get_environments(&self) -> Result<Vec<Environment>> {
        let payload: EnvironmentsPayload = self.get("/core/environments").await?;
        Ok(payload.environments)
    }

    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment> {
        let payload: EnvironmentPayload = self.post("/core/environments", &request).await?;
        Ok(payload.environment)
    }

    async fn get_key_pairs(&self) -> Result<Vec<KeyPair>> {
        let payload: KeyPairsPayload = self.get("/core/keypairs").await?;
        Ok(payload.keypairs)
    }

    async fn import_key_pair(&self, request: ImportKeyPairRequest) -> Result<KeyPair> {
        let payload: KeyPairPayload = self.post("/core/keypairs", &request).await?;
        Ok(payload.keypair)
    }

    async fn get_pricebook(&self) -> Result<Vec<PriceEntry>> {
        // The pricebook endpoint returns a bare array, not the usual
        // envelope.
        tracing::debug!("GET hyperstack /pricebook");
        let response = self
            .http
            .get(self.url("/pricebook"))
            .header("api_key", &self.config.api_key)
            .header("accept", "application/json")
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HyperstackError::Api {
                status: Some(status.as_u16()),
                message: body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}
