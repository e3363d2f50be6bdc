//! The persistence collaborator: narrow, field-scoped accessors over the
//! compute server records and the per-cloud cache rows.
//!
//! Row-level permissions are enforced outside this core; the trait only
//! exposes the writes the orchestrator itself is allowed to make. `set_data`
//! routes through the reconciler merge, so partial patches are the only way
//! provider data ever reaches a record.

use crate::error::{CloudError, Result};
use crate::reconcile::merge_data;
use crate::server::{Cloud, ComponentState, ComputeServer, Configuration, DataPatch, ServerId};
use crate::state::State;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// One raw cache row: serialized value plus an absolute expiry timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: String,
    pub expire: DateTime<Utc>,
}

/// Persistence operations the orchestrator core needs.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_server(&self, id: ServerId) -> Result<ComputeServer>;

    /// Partial-merge `patch` into the record's data via the reconciler.
    /// `cloud` is the caller's claim about which driver owns the data; it
    /// must match both the patch and the record.
    async fn set_data(&self, cloud: Cloud, id: ServerId, patch: DataPatch) -> Result<()>;

    async fn set_state(&self, id: ServerId, state: State, changed_at: DateTime<Utc>)
    -> Result<()>;

    async fn set_error(&self, id: ServerId, error: Option<String>) -> Result<()>;

    async fn set_configuration(&self, id: ServerId, configuration: Configuration) -> Result<()>;

    async fn set_provisioned_configuration(
        &self,
        id: ServerId,
        configuration: Configuration,
    ) -> Result<()>;

    /// Upsert one component's diagnostic sub-state. Each producer owns its
    /// own key; writes to different components never conflict.
    async fn set_detailed_state(
        &self,
        id: ServerId,
        component: &str,
        state: ComponentState,
    ) -> Result<()>;

    async fn cache_get(&self, cloud: Cloud, key: &str) -> Result<Option<CacheEntry>>;

    async fn cache_set(&self, cloud: Cloud, key: &str, entry: CacheEntry) -> Result<()>;
}

/// In-memory store: the single-process runtime backend and the test double.
#[derive(Default)]
pub struct MemoryStore {
    servers: Mutex<HashMap<ServerId, ComputeServer>>,
    cache: Mutex<HashMap<(Cloud, String), CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous one with the same id.
    pub fn insert(&self, server: ComputeServer) {
        self.servers
            .lock()
            .expect("server map poisoned")
            .insert(server.id, server);
    }

    fn with_server<T>(
        &self,
        id: ServerId,
        f: impl FnOnce(&mut ComputeServer) -> Result<T>,
    ) -> Result<T> {
        let mut servers = self.servers.lock().expect("server map poisoned");
        let server = servers.get_mut(&id).ok_or(CloudError::ServerNotFound(id))?;
        f(server)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_server(&self, id: ServerId) -> Result<ComputeServer> {
        let now = Utc::now();
        self.with_server(id, |server| {
            server
                .detailed_state
                .retain(|_, component| !component.is_expired(now));
            Ok(server.clone())
        })
    }

    async fn set_data(&self, cloud: Cloud, id: ServerId, patch: DataPatch) -> Result<()> {
        if patch.cloud() != cloud {
            return Err(CloudError::StaleData {
                configured: cloud,
                data: patch.cloud(),
            });
        }
        self.with_server(id, |server| {
            let merged = merge_data(server.cloud, server.data.take(), patch)?;
            server.data = Some(merged);
            Ok(())
        })
    }

    async fn set_state(
        &self,
        id: ServerId,
        state: State,
        changed_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_server(id, |server| {
            server.state = Some(state);
            server.state_changed = Some(changed_at);
            Ok(())
        })
    }

    async fn set_error(&self, id: ServerId, error: Option<String>) -> Result<()> {
        self.with_server(id, |server| {
            server.error = error;
            Ok(())
        })
    }

    async fn set_configuration(&self, id: ServerId, configuration: Configuration) -> Result<()> {
        self.with_server(id, |server| {
            server.cloud = configuration.cloud();
            server.configuration = configuration;
            Ok(())
        })
    }

    async fn set_provisioned_configuration(
        &self,
        id: ServerId,
        configuration: Configuration,
    ) -> Result<()> {
        self.with_server(id, |server| {
            server.provisioned_configuration = Some(configuration);
            Ok(())
        })
    }

    async fn set_detailed_state(
        &self,
        id: ServerId,
        component: &str,
        state: ComponentState,
    ) -> Result<()> {
        self.with_server(id, |server| {
            server.detailed_state.insert(component.to_string(), state);
            Ok(())
        })
    }

    async fn cache_get(&self, cloud: Cloud, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self
            .cache
            .lock()
            .expect("cache map poisoned")
            .get(&(cloud, key.to_string()))
            .cloned())
    }

    async fn cache_set(&self, cloud: Cloud, key: &str, entry: CacheEntry) -> Result<()> {
        self.cache
            .lock()
            .expect("cache map poisoned")
            .insert((cloud, key.to_string()), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperstack::{HyperstackConfiguration, HyperstackDataPatch, Region, VolumeId};
    use crate::reconcile::FieldPatch;
    use crate::server::Data;

    fn server(id: i64) -> ComputeServer {
        ComputeServer::new(
            ServerId(id),
            "acct",
            "proj",
            Configuration::Hyperstack(HyperstackConfiguration {
                flavor_name: "n1-cpu-small".into(),
                region_name: Region::Canada1,
                disk_size_gb: 10,
                image: None,
                dns: None,
                ephemeral: false,
            }),
        )
    }

    #[tokio::test]
    async fn missing_server_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_server(ServerId(1)).await,
            Err(CloudError::ServerNotFound(ServerId(1)))
        ));
    }

    #[tokio::test]
    async fn set_data_merges_through_the_reconciler() {
        let store = MemoryStore::new();
        store.insert(server(1));
        store
            .set_data(
                Cloud::Hyperstack,
                ServerId(1),
                DataPatch::Hyperstack(HyperstackDataPatch {
                    disks: FieldPatch::Set(vec![VolumeId(101)]),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        store
            .set_data(
                Cloud::Hyperstack,
                ServerId(1),
                DataPatch::Hyperstack(HyperstackDataPatch {
                    external_ip: FieldPatch::Set("203.0.113.7".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let loaded = store.get_server(ServerId(1)).await.unwrap();
        let Some(Data::Hyperstack(data)) = loaded.data else {
            panic!("expected hyperstack data");
        };
        assert_eq!(data.disks, Some(vec![VolumeId(101)]));
        assert_eq!(data.external_ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn expired_detailed_state_is_dropped_on_read() {
        let store = MemoryStore::new();
        store.insert(server(1));
        let now = Utc::now();
        store
            .set_detailed_state(
                ServerId(1),
                "filesystem",
                ComponentState {
                    state: "syncing".into(),
                    time: now,
                    expire: Some(now - chrono::Duration::seconds(1)),
                },
            )
            .await
            .unwrap();
        store
            .set_detailed_state(
                ServerId(1),
                "vm",
                ComponentState {
                    state: "running".into(),
                    time: now,
                    expire: None,
                },
            )
            .await
            .unwrap();
        let loaded = store.get_server(ServerId(1)).await.unwrap();
        assert!(!loaded.detailed_state.contains_key("filesystem"));
        assert!(loaded.detailed_state.contains_key("vm"));
    }
}
