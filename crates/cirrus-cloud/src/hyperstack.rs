//! Hyperstack wire types shared between the record model and the driver.
//!
//! The persisted `data` blob for a Hyperstack server embeds the provider's
//! own VM description, so these types live here rather than in the driver
//! crate: both the record model and the driver need them.

use crate::reconcile::FieldPatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hyperstack regions we can provision in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "CANADA-1")]
    Canada1,
    #[serde(rename = "NORWAY-1")]
    Norway1,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Canada1 => write!(f, "CANADA-1"),
            Region::Norway1 => write!(f, "NORWAY-1"),
        }
    }
}

/// Provider-assigned id of a block storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(pub i64);

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A named sub-object inside provider payloads (flavor, environment, keypair).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

/// The provider's description of a virtual machine, stored verbatim in the
/// record's `data.vm` whenever we observe it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub vm_state: Option<String>,
    #[serde(default)]
    pub flavor: Option<NamedRef>,
    #[serde(default)]
    pub environment: Option<NamedRef>,
    #[serde(default)]
    pub keypair: Option<NamedRef>,
    #[serde(default)]
    pub floating_ip: Option<String>,
    #[serde(default)]
    pub fixed_ip: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl VirtualMachine {
    /// All three provider status fields agree the VM is fully up. Anything
    /// short of this triple is ambiguous: the payload does not distinguish a
    /// VM that is booting from one that is shutting down.
    pub fn is_fully_active(&self) -> bool {
        self.status.as_deref() == Some("ACTIVE")
            && self.power_state.as_deref() == Some("RUNNING")
            && self.vm_state.as_deref() == Some("active")
    }
}

/// Desired specs for a Hyperstack compute server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperstackConfiguration {
    /// Provider machine type, e.g. `n1-RTX-A4000x1`.
    pub flavor_name: String,
    pub region_name: Region,
    /// Size of the data disk in GB; the 50 GB boot disk is separate and not
    /// configurable. Zero means no data disk.
    pub disk_size_gb: u32,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Live provider-side state for a Hyperstack server. Exclusively owned by
/// the Hyperstack driver; opaque to everyone else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HyperstackData {
    /// Name we are using for the VM.
    #[serde(default)]
    pub name: Option<String>,
    /// The provider's latest description of the VM, if one exists.
    #[serde(default)]
    pub vm: Option<VirtualMachine>,
    /// Ids of persistent volumes, boot disk first.
    #[serde(default)]
    pub disks: Option<Vec<VolumeId>>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// Field-scoped partial update of [`HyperstackData`].
#[derive(Debug, Clone, Default)]
pub struct HyperstackDataPatch {
    pub name: FieldPatch<String>,
    pub vm: FieldPatch<VirtualMachine>,
    pub disks: FieldPatch<Vec<VolumeId>>,
    pub external_ip: FieldPatch<String>,
    pub creation_timestamp: FieldPatch<DateTime<Utc>>,
}

impl HyperstackDataPatch {
    /// Apply field by field; untouched fields keep their current value so
    /// concurrent writers touching different fields do not clobber each
    /// other.
    pub fn apply(self, data: &mut HyperstackData) {
        self.name.apply(&mut data.name);
        self.vm.apply(&mut data.vm);
        self.disks.apply(&mut data.disks);
        self.external_ip.apply(&mut data.external_ip);
        self.creation_timestamp.apply(&mut data.creation_timestamp);
    }
}
