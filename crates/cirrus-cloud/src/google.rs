//! Google Cloud configuration and data types.
//!
//! No driver for this cloud ships in this workspace yet; the types exist so
//! the tagged unions stay exhaustive and adding the driver is a
//! compile-time-checked change rather than a schema migration.

use crate::reconcile::FieldPatch;
use crate::state::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Desired specs for a Google Cloud compute server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleCloudConfiguration {
    pub region: String,
    pub zone: String,
    pub machine_type: String,
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub disk_size_gb: Option<u32>,
    #[serde(default)]
    pub source_image: Option<String>,
}

/// Live provider-side state for a Google Cloud server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoogleCloudData {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<State>,
    #[serde(default)]
    pub cpu_platform: Option<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_start_timestamp: Option<DateTime<Utc>>,
}

/// Field-scoped partial update of [`GoogleCloudData`].
#[derive(Debug, Clone, Default)]
pub struct GoogleCloudDataPatch {
    pub name: FieldPatch<String>,
    pub state: FieldPatch<State>,
    pub cpu_platform: FieldPatch<String>,
    pub external_ip: FieldPatch<String>,
    pub creation_timestamp: FieldPatch<DateTime<Utc>>,
    pub last_start_timestamp: FieldPatch<DateTime<Utc>>,
}

impl GoogleCloudDataPatch {
    pub fn apply(self, data: &mut GoogleCloudData) {
        self.name.apply(&mut data.name);
        self.state.apply(&mut data.state);
        self.cpu_platform.apply(&mut data.cpu_platform);
        self.external_ip.apply(&mut data.external_ip);
        self.creation_timestamp.apply(&mut data.creation_timestamp);
        self.last_start_timestamp.apply(&mut data.last_start_timestamp);
    }
}
