//! The Hyperstack API contract the driver programs against.
//!
//! Each method is one provider RPC with a documented success/failure
//! contract; the driver pattern-matches the retryable error classes (see
//! [`crate::error::HyperstackError`]) and treats everything else as fatal.
//! The trait exists so the driver can be exercised against a mock in tests
//! and against [`crate::client::HyperstackClient`] in production.

use crate::error::Result;
use async_trait::async_trait;
use cirrus_cloud::hyperstack::{Region, VirtualMachine, VolumeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(rename = "size")]
    pub size_gb: u32,
    pub environment_name: String,
    /// Image to stamp onto the volume; set for boot disks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityRule {
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub protocol: String,
    pub direction: String,
    pub remote_ip_prefix: String,
}

impl SecurityRule {
    /// Ingress TCP open to the world on one port range.
    pub fn tcp(port_range_min: u16, port_range_max: u16) -> Self {
        Self {
            port_range_min,
            port_range_max,
            protocol: "tcp".into(),
            direction: "ingress".into(),
            remote_ip_prefix: "0.0.0.0/0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVirtualMachinesRequest {
    pub name: String,
    pub environment_name: String,
    /// Boot volume to attach; must already exist (creation is rejected with
    /// a retryable error until it does).
    pub volume_name: String,
    pub key_name: String,
    pub flavor_name: String,
    pub assign_floating_ip: bool,
    pub security_rules: Vec<SecurityRule>,
    pub count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub region: Option<Region>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub region: Region,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyPair {
    pub name: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportKeyPairRequest {
    pub name: String,
    pub environment_name: String,
    pub public_key: String,
}

/// One row of the provider's price book. `value` is dollars per hour as a
/// decimal string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEntry {
    pub name: String,
    #[serde(default)]
    pub region_name: Option<String>,
    pub value: String,
}

/// Typed RPC surface of the Hyperstack API.
#[async_trait]
pub trait HyperstackApi: Send + Sync {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume>;

    async fn delete_volume(&self, id: VolumeId) -> Result<()>;

    async fn attach_volumes(&self, vm_id: i64, volume_ids: Vec<VolumeId>) -> Result<()>;

    /// Create VMs. The provider API takes a count and returns a list even
    /// for a single machine.
    async fn create_virtual_machines(
        &self,
        request: CreateVirtualMachinesRequest,
    ) -> Result<Vec<VirtualMachine>>;

    async fn delete_virtual_machine(&self, id: i64) -> Result<()>;

    async fn start_virtual_machine(&self, id: i64) -> Result<()>;

    async fn hard_reboot_virtual_machine(&self, id: i64) -> Result<()>;

    async fn get_virtual_machine(&self, id: i64) -> Result<VirtualMachine>;

    async fn get_environments(&self) -> Result<Vec<Environment>>;

    async fn create_environment(&self, request: CreateEnvironmentRequest) -> Result<Environment>;

    async fn get_key_pairs(&self) -> Result<Vec<KeyPair>>;

    async fn import_key_pair(&self, request: ImportKeyPairRequest) -> Result<KeyPair>;

    async fn get_pricebook(&self) -> Result<Vec<PriceEntry>>;
}
