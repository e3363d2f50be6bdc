//! The persistent compute server record and its tagged-union configuration
//! and data types.
//!
//! The record is owned by the persistence collaborator; the orchestrator
//! reads and writes it through the narrow accessors on [`crate::store::Store`].
//! `configuration` and `data` are sum types discriminated by cloud, with
//! exhaustive matching at every consumption site.

use crate::error::CloudError;
use crate::google::{GoogleCloudConfiguration, GoogleCloudData, GoogleCloudDataPatch};
use crate::hyperstack::{HyperstackConfiguration, HyperstackData, HyperstackDataPatch};
use crate::state::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable identity of a compute server record. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Tag identifying which provider driver owns a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cloud {
    Hyperstack,
    GoogleCloud,
}

impl std::fmt::Display for Cloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cloud::Hyperstack => write!(f, "hyperstack"),
            Cloud::GoogleCloud => write!(f, "google-cloud"),
        }
    }
}

/// Desired specs for a server, discriminated by cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cloud", rename_all = "kebab-case")]
pub enum Configuration {
    Hyperstack(HyperstackConfiguration),
    GoogleCloud(GoogleCloudConfiguration),
}

impl Configuration {
    pub fn cloud(&self) -> Cloud {
        match self {
            Configuration::Hyperstack(_) => Cloud::Hyperstack,
            Configuration::GoogleCloud(_) => Cloud::GoogleCloud,
        }
    }
}

/// Cloud-specific live state: VM handle, disk ids, external IP, timestamps.
/// Exclusively owned by the provider driver for that cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cloud", rename_all = "kebab-case")]
pub enum Data {
    Hyperstack(HyperstackData),
    GoogleCloud(GoogleCloudData),
}

impl Data {
    pub fn cloud(&self) -> Cloud {
        match self {
            Data::Hyperstack(_) => Cloud::Hyperstack,
            Data::GoogleCloud(_) => Cloud::GoogleCloud,
        }
    }

    /// Fresh empty data for `cloud`, the starting point of the first merge.
    pub fn empty(cloud: Cloud) -> Data {
        match cloud {
            Cloud::Hyperstack => Data::Hyperstack(HyperstackData::default()),
            Cloud::GoogleCloud => Data::GoogleCloud(GoogleCloudData::default()),
        }
    }
}

/// A field-scoped partial update of [`Data`], discriminated by cloud.
#[derive(Debug, Clone)]
pub enum DataPatch {
    Hyperstack(HyperstackDataPatch),
    GoogleCloud(GoogleCloudDataPatch),
}

impl DataPatch {
    pub fn cloud(&self) -> Cloud {
        match self {
            DataPatch::Hyperstack(_) => Cloud::Hyperstack,
            DataPatch::GoogleCloud(_) => Cloud::GoogleCloud,
        }
    }
}

/// Diagnostic sub-state of one server component (VM, filesystem sync, ...).
/// Each producer owns its own key in `detailed_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub state: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub expire: Option<DateTime<Utc>>,
}

impl ComponentState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expire, Some(expire) if expire <= now)
    }
}

/// The persistent compute server record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeServer {
    pub id: ServerId,
    /// User that owns this compute server.
    pub account_id: String,
    /// The project this compute server provides compute for.
    pub project_id: String,
    pub cloud: Cloud,
    /// Desired specs. User-writable only through the facade's validated
    /// setter.
    pub configuration: Configuration,
    /// Configuration actually realized in the cloud the last time a
    /// provision succeeded; used to detect re-provision drift.
    #[serde(default)]
    pub provisioned_configuration: Option<Configuration>,
    /// Written only through the reconciler's partial-merge path.
    #[serde(default)]
    pub data: Option<Data>,
    /// Derived, never trusted as ground truth on its own.
    #[serde(default)]
    pub state: Option<State>,
    #[serde(default)]
    pub state_changed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost_per_hour: Option<f64>,
    #[serde(default)]
    pub purchase_id: Option<i64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detailed_state: BTreeMap<String, ComponentState>,
    /// Last fatal message surfaced to the user; cleared whenever a new
    /// action is attempted.
    #[serde(default)]
    pub error: Option<String>,
    /// Records are soft-deleted to preserve billing history.
    #[serde(default)]
    pub deleted: bool,
}

impl ComputeServer {
    /// A new record starts deprovisioned: no provider data, nothing billed.
    pub fn new(
        id: ServerId,
        account_id: impl Into<String>,
        project_id: impl Into<String>,
        configuration: Configuration,
    ) -> Self {
        Self {
            id,
            account_id: account_id.into(),
            project_id: project_id.into(),
            cloud: configuration.cloud(),
            configuration,
            provisioned_configuration: None,
            data: None,
            state: Some(State::Deprovisioned),
            state_changed: None,
            cost_per_hour: None,
            purchase_id: None,
            detailed_state: BTreeMap::new(),
            error: None,
            deleted: false,
        }
    }

    /// The record's data, after verifying its cloud tag matches the
    /// configured cloud. A mismatch means the record's cloud was changed
    /// without clearing old provider handles; failing fast here beats
    /// trusting handles from the wrong provider.
    pub fn checked_data(&self) -> Result<Option<&Data>, CloudError> {
        match &self.data {
            None => Ok(None),
            Some(data) if data.cloud() == self.cloud => Ok(Some(data)),
            Some(data) => Err(CloudError::StaleData {
                configured: self.cloud,
                data: data.cloud(),
            }),
        }
    }
}
