//! The cloud-agnostic orchestration facade.
//!
//! Given a server record, dispatches to the provider driver that owns its
//! cloud and exposes the uniform action surface to the rest of the system.
//! All legality decisions come from the state/action tables; the facade
//! never hardcodes a transition.

use crate::error::{CloudError, Result};
use crate::provider::{CloudProvider, QuotaDecision, QuotaOracle};
use crate::server::{Cloud, ComponentState, ComputeServer, Configuration, ServerId};
use crate::state::{Action, State};
use crate::store::Store;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Dispatches lifecycle actions to per-cloud drivers.
pub struct Orchestrator {
    providers: HashMap<Cloud, Arc<dyn CloudProvider>>,
    store: Arc<dyn Store>,
    quota: Arc<dyn QuotaOracle>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, quota: Arc<dyn QuotaOracle>) -> Self {
        Self {
            providers: HashMap::new(),
            store,
            quota,
        }
    }

    /// Register the driver for one cloud, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn CloudProvider>) {
        self.providers.insert(provider.cloud(), provider);
    }

    fn provider(&self, cloud: Cloud) -> Result<&Arc<dyn CloudProvider>> {
        self.providers
            .get(&cloud)
            .ok_or(CloudError::ProviderNotFound(cloud))
    }

    /// Apply `action` to the server, recording any failure in the record's
    /// `error` field. Returns the state observed after the action.
    pub async fn apply(&self, id: ServerId, action: Action) -> Result<State> {
        match self.apply_inner(id, action).await {
            Ok(state) => Ok(state),
            Err(err) => {
                // The error field is the single channel surfacing fatal
                // messages to the user.
                if let Err(store_err) = self.store.set_error(id, Some(err.to_string())).await {
                    tracing::warn!(%id, %store_err, "failed to record error on server");
                }
                Err(err)
            }
        }
    }

    async fn apply_inner(&self, id: ServerId, action: Action) -> Result<State> {
        let server = self.store.get_server(id).await?;
        if server.deleted {
            return Err(CloudError::ServerDeleted(id));
        }
        // Stale errors must not persist across a new attempt.
        self.store.set_error(id, None).await?;

        if !action.supported_on(server.cloud) {
            return Err(CloudError::ActionNotSupported {
                action,
                cloud: server.cloud,
            });
        }
        let provider = self.provider(server.cloud)?;
        let current = provider.state(&server).await?;
        if !current.allows(action) {
            return Err(CloudError::ActionNotAllowed {
                action,
                state: current,
            });
        }
        if matches!(action, Action::Start | Action::Resume) {
            match self.quota.allow(&server, action).await? {
                QuotaDecision::Allowed => {}
                QuotaDecision::Denied { reason } => {
                    return Err(CloudError::QuotaDenied(reason));
                }
            }
        }

        tracing::info!(%id, %action, %current, "applying action");
        let was_deprovisioned = current == State::Deprovisioned;
        if let Some(transient) = action.transient_state() {
            self.store.set_state(id, transient, Utc::now()).await?;
        }
        match action {
            Action::Start => provider.start(&server).await?,
            Action::Resume => provider.resume(&server).await?,
            Action::Stop => provider.stop(&server).await?,
            Action::Suspend => provider.suspend(&server).await?,
            Action::Deprovision => provider.deprovision(&server).await?,
            Action::Reboot => provider.reboot(&server).await?,
        }
        if action == Action::Start && was_deprovisioned {
            self.store
                .set_provisioned_configuration(id, server.configuration.clone())
                .await?;
        }

        // The driver mutated `data`; observe and persist the result.
        let refreshed = self.store.get_server(id).await?;
        let observed = provider.state(&refreshed).await?;
        self.store.set_state(id, observed, Utc::now()).await?;
        Ok(observed)
    }

    pub async fn start(&self, id: ServerId) -> Result<State> {
        self.apply(id, Action::Start).await
    }

    pub async fn stop(&self, id: ServerId) -> Result<State> {
        self.apply(id, Action::Stop).await
    }

    pub async fn reboot(&self, id: ServerId) -> Result<State> {
        self.apply(id, Action::Reboot).await
    }

    pub async fn deprovision(&self, id: ServerId) -> Result<State> {
        self.apply(id, Action::Deprovision).await
    }

    /// Resolve and persist the server's current state.
    pub async fn state(&self, id: ServerId) -> Result<State> {
        let server = self.store.get_server(id).await?;
        let provider = self.provider(server.cloud)?;
        let state = provider.state(&server).await?;
        if server.state != Some(state) {
            self.store.set_state(id, state, Utc::now()).await?;
        }
        Ok(state)
    }

    /// Cost in dollars per hour of the server sitting in `state`.
    pub async fn cost_per_hour(&self, id: ServerId, state: State) -> Result<f64> {
        let server = self.store.get_server(id).await?;
        let provider = self.provider(server.cloud)?;
        provider.cost_per_hour(&server, state).await
    }

    /// Validated configuration setter. The cloud tag is immutable once
    /// provider data exists; everything else is stored verbatim.
    pub async fn set_configuration(
        &self,
        id: ServerId,
        configuration: Configuration,
    ) -> Result<()> {
        let server = self.store.get_server(id).await?;
        if server.deleted {
            return Err(CloudError::ServerDeleted(id));
        }
        if configuration.cloud() != server.cloud && server.data.is_some() {
            return Err(CloudError::WrongCloud {
                expected: server.cloud,
                got: configuration.cloud(),
            });
        }
        self.store.set_configuration(id, configuration).await
    }

    /// Record one component's diagnostic sub-state, visible until `ttl`
    /// passes (forever if `None`).
    pub async fn set_detailed_state(
        &self,
        id: ServerId,
        component: &str,
        state: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Utc::now();
        let expire = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| now + ttl)
        });
        self.store
            .set_detailed_state(
                id,
                component,
                ComponentState {
                    state: state.into(),
                    time: now,
                    expire,
                },
            )
            .await
    }
}
