//! Cloud provider trait definition.

use crate::error::{CloudError, Result};
use crate::server::{Cloud, ComputeServer};
use crate::state::{Action, State};
use async_trait::async_trait;

/// The uniform per-cloud driver contract.
///
/// All provider drivers (Hyperstack, Google Cloud, ...) implement this trait
/// so the orchestration facade can dispatch on the record's cloud tag.
/// Mutating calls must be idempotent by intent: re-calling `start` after a
/// crash mid-sequence resumes the remaining steps.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// The cloud this driver owns records for.
    fn cloud(&self) -> Cloud;

    /// Bring the server up, provisioning disks and a VM as needed.
    /// A concurrent second start for the same id is a no-op.
    async fn start(&self, server: &ComputeServer) -> Result<()>;

    /// Tear the VM down, leaving every disk intact.
    async fn stop(&self, server: &ComputeServer) -> Result<()>;

    /// Hard-reboot the VM; does not alter persisted data.
    async fn reboot(&self, server: &ComputeServer) -> Result<()>;

    /// Delete the VM and every disk. The only operation allowed to destroy
    /// disks.
    async fn deprovision(&self, server: &ComputeServer) -> Result<()>;

    /// Resolve the server's current state. A pure read of provider
    /// resources; may reconcile observed state into the record but must not
    /// mutate anything in the cloud.
    async fn state(&self, server: &ComputeServer) -> Result<State>;

    /// Cost in dollars per hour of `server` sitting in `state`. Only defined
    /// for stable states; callers resolve transient states to their target
    /// first.
    async fn cost_per_hour(&self, server: &ComputeServer, state: State) -> Result<f64>;

    /// Suspend to disk. Only some clouds support this; the default rejects.
    async fn suspend(&self, _server: &ComputeServer) -> Result<()> {
        Err(CloudError::ActionNotSupported {
            action: Action::Suspend,
            cloud: self.cloud(),
        })
    }

    /// Resume from suspend. Only some clouds support this; the default
    /// rejects.
    async fn resume(&self, _server: &ComputeServer) -> Result<()> {
        Err(CloudError::ActionNotSupported {
            action: Action::Resume,
            cloud: self.cloud(),
        })
    }
}

/// Billing decision for a paid action.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    Allowed,
    Denied { reason: String },
}

/// The billing/purchase collaborator, reduced to the allow/deny boundary
/// this core consults before paid actions.
#[async_trait]
pub trait QuotaOracle: Send + Sync {
    async fn allow(&self, server: &ComputeServer, action: Action) -> Result<QuotaDecision>;
}

/// Oracle that allows everything; for tests and self-hosted deployments
/// without billing.
pub struct AllowAll;

#[async_trait]
impl QuotaOracle for AllowAll {
    async fn allow(&self, _server: &ComputeServer, _action: Action) -> Result<QuotaDecision> {
        Ok(QuotaDecision::Allowed)
    }
}
