//! Hyperstack provider driver implementation.
//!
//! Translates the uniform start/stop/reboot/deprovision/state/cost contract
//! into Hyperstack API calls. The driver owns the record's `data` sub-object
//! for this cloud and an in-memory in-flight registry; everything durable
//! goes through the store's partial-merge writes, persisted step by step so
//! a crash mid-sequence is resumable by calling the same action again.

use crate::api::{
    CreateEnvironmentRequest, CreateVirtualMachinesRequest, CreateVolumeRequest, HyperstackApi,
    ImportKeyPairRequest, SecurityRule,
};
use crate::error::{HyperstackError, Result};
use crate::pricing::{BOOT_DISK_SIZE_GB, PricingData, compute_cost};
use async_trait::async_trait;
use chrono::Utc;
use cirrus_cloud::guard::{BeginOutcome, InFlight, Op};
use cirrus_cloud::hyperstack::{
    HyperstackConfiguration, HyperstackData, HyperstackDataPatch, Region, VolumeId,
};
use cirrus_cloud::retry::{RetryError, RetryPolicy, retry};
use cirrus_cloud::{
    Cloud, CloudError, CloudProvider, ComputeServer, Configuration, Data, DataPatch, FieldPatch,
    ResourceCache, ServerId, State, Store,
};
use std::sync::Arc;
use std::time::Duration;

/// Boot volume image per region ("Ubuntu Server 22.04 LTS R535 CUDA 12.2").
fn boot_image_id(region: Region) -> i64 {
    match region {
        Region::Canada1 => 29,
        Region::Norway1 => 33,
    }
}

/// By default we open up tcp for ssh and the web server.
fn default_security_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule::tcp(22, 22),
        SecurityRule::tcp(80, 80),
        SecurityRule::tcp(443, 443),
    ]
}

const ENVIRONMENT_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const KEY_PAIR_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const PRICEBOOK_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const PRICEBOOK_CACHE_KEY: &str = "pricebook";

/// Deployment-level settings for this driver.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Prefix on every cloud resource name we create, so one Hyperstack
    /// account can host several deployments side by side.
    pub prefix: String,
    /// Public key installed on every VM we create.
    pub ssh_public_key: String,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            prefix: "cirrus".into(),
            ssh_public_key: String::new(),
        }
    }
}

/// Retry shapes for the provider calls that fail transiently. Production
/// defaults are generous because volume provisioning in some regions takes
/// many minutes; tests shrink them.
#[derive(Debug, Clone)]
pub struct DriverTuning {
    /// VM creation is rejected until the boot volume exists.
    pub vm_create: RetryPolicy,
    /// Volumes cannot attach until the VM is sufficiently booted.
    pub volume_attach: RetryPolicy,
    /// Volume deletion is transiently rejected while the backend releases
    /// the device.
    pub volume_delete: RetryPolicy,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self {
            vm_create: RetryPolicy::new(
                Duration::from_secs(3),
                1.3,
                Duration::from_secs(10),
                Duration::from_secs(30 * 60),
            ),
            volume_attach: RetryPolicy::new(
                Duration::from_secs(3),
                1.3,
                Duration::from_millis(7500),
                Duration::from_secs(5 * 60),
            ),
            volume_delete: RetryPolicy::new(
                Duration::from_secs(5),
                1.3,
                Duration::from_secs(15),
                Duration::from_secs(15 * 60),
            ),
        }
    }
}

/// Hyperstack provider driver.
pub struct HyperstackDriver {
    api: Arc<dyn HyperstackApi>,
    store: Arc<dyn Store>,
    cache: ResourceCache,
    inflight: InFlight,
    settings: DriverSettings,
    tuning: DriverTuning,
}

impl HyperstackDriver {
    pub fn new(
        api: Arc<dyn HyperstackApi>,
        store: Arc<dyn Store>,
        settings: DriverSettings,
    ) -> Self {
        let cache = ResourceCache::new(store.clone());
        Self {
            api,
            store,
            cache,
            inflight: InFlight::new(),
            settings,
            tuning: DriverTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: DriverTuning) -> Self {
        self.tuning = tuning;
        self
    }

    fn server_name(&self, id: ServerId) -> String {
        format!("{}-{}", self.settings.prefix, id)
    }

    /// Disk `n` of a server; disk 0 is the boot disk.
    fn disk_name(&self, id: ServerId, n: usize) -> String {
        format!("{}-{}", self.server_name(id), n)
    }

    fn environment_name(&self, region: Region) -> String {
        format!("{}-{}", self.settings.prefix, region)
    }

    fn key_pair_name(&self, region: Region) -> String {
        format!("{}-{}", self.settings.prefix, region)
    }

    fn configuration<'a>(
        &self,
        server: &'a ComputeServer,
    ) -> Result<&'a HyperstackConfiguration> {
        match &server.configuration {
            Configuration::Hyperstack(config) => Ok(config),
            other => Err(CloudError::WrongCloud {
                expected: Cloud::Hyperstack,
                got: other.cloud(),
            }
            .into()),
        }
    }

    fn data(&self, server: &ComputeServer) -> Result<Option<HyperstackData>> {
        match server.checked_data()? {
            None => Ok(None),
            Some(Data::Hyperstack(data)) => Ok(Some(data.clone())),
            Some(other) => Err(CloudError::StaleData {
                configured: Cloud::Hyperstack,
                data: other.cloud(),
            }
            .into()),
        }
    }

    /// Partial-merge `patch` into the record. The external IP mirrors the
    /// vm field: set alongside it from the floating IP, cleared with it.
    async fn set_data(&self, id: ServerId, mut patch: HyperstackDataPatch) -> Result<()> {
        match &patch.vm {
            FieldPatch::Set(vm) => {
                patch.external_ip = FieldPatch::from_option(vm.floating_ip.clone());
            }
            FieldPatch::Clear => patch.external_ip = FieldPatch::Clear,
            FieldPatch::Keep => {}
        }
        self.store
            .set_data(Cloud::Hyperstack, id, DataPatch::Hyperstack(patch))
            .await?;
        Ok(())
    }

    /// Resolve the environment for `region`, creating it on first use.
    /// The listing is slow and rate-limited upstream, so a successful
    /// resolution is cached.
    async fn ensure_environment(&self, region: Region) -> Result<String> {
        let name = self.environment_name(region);
        let cache_key = format!("environment/{name}");
        if self.cache.get::<bool>(Cloud::Hyperstack, &cache_key).await? == Some(true) {
            return Ok(name);
        }
        let environments = self.api.get_environments().await?;
        if !environments.iter().any(|e| e.name == name) {
            tracing::debug!(%name, %region, "creating environment");
            self.api
                .create_environment(CreateEnvironmentRequest {
                    name: name.clone(),
                    region,
                })
                .await?;
        }
        self.cache
            .set(Cloud::Hyperstack, &cache_key, &true, ENVIRONMENT_CACHE_TTL)
            .await?;
        Ok(name)
    }

    async fn ensure_key_pair(&self, region: Region, environment_name: &str) -> Result<String> {
        let name = self.key_pair_name(region);
        let cache_key = format!("keypair/{name}");
        if self.cache.get::<bool>(Cloud::Hyperstack, &cache_key).await? == Some(true) {
            return Ok(name);
        }
        let key_pairs = self.api.get_key_pairs().await?;
        if !key_pairs.iter().any(|k| k.name == name) {
            tracing::debug!(%name, "importing key pair");
            self.api
                .import_key_pair(ImportKeyPairRequest {
                    name: name.clone(),
                    environment_name: environment_name.to_string(),
                    public_key: self.settings.ssh_public_key.clone(),
                })
                .await?;
        }
        self.cache
            .set(Cloud::Hyperstack, &cache_key, &true, KEY_PAIR_CACHE_TTL)
            .await?;
        Ok(name)
    }

    async fn pricing_data(&self) -> Result<PricingData> {
        if let Some(pricing) = self
            .cache
            .get::<PricingData>(Cloud::Hyperstack, PRICEBOOK_CACHE_KEY)
            .await?
        {
            return Ok(pricing);
        }
        let pricebook = self.api.get_pricebook().await?;
        let pricing = PricingData::from_pricebook(&pricebook);
        self.cache
            .set(
                Cloud::Hyperstack,
                PRICEBOOK_CACHE_KEY,
                &pricing,
                PRICEBOOK_CACHE_TTL,
            )
            .await?;
        Ok(pricing)
    }

    async fn start_inner(&self, server: &ComputeServer) -> Result<()> {
        let id = server.id;
        let config = self.configuration(server)?;
        let data = self.data(server)?.unwrap_or_default();
        let mut disks = data.disks.clone().unwrap_or_default();

        if disks.is_empty() {
            tracing::debug!(%id, "start: creating boot disk");
            let environment_name = self.ensure_environment(config.region_name).await?;
            let volume = self
                .api
                .create_volume(CreateVolumeRequest {
                    name: self.disk_name(id, 0),
                    size_gb: BOOT_DISK_SIZE_GB,
                    environment_name,
                    image_id: Some(boot_image_id(config.region_name)),
                })
                .await?;
            disks.push(volume.id);
            // Persist the id before doing anything else: an unpersisted
            // disk is an orphaned paid resource.
            self.set_data(
                id,
                HyperstackDataPatch {
                    name: FieldPatch::Set(self.server_name(id)),
                    disks: FieldPatch::Set(disks.clone()),
                    ..Default::default()
                },
            )
            .await?;
        }

        if disks.len() == 1 && config.disk_size_gb > 0 {
            tracing::debug!(%id, size_gb = config.disk_size_gb, "start: creating data disk");
            let environment_name = self.ensure_environment(config.region_name).await?;
            let volume = self
                .api
                .create_volume(CreateVolumeRequest {
                    name: self.disk_name(id, 1),
                    size_gb: config.disk_size_gb,
                    environment_name,
                    image_id: None,
                })
                .await?;
            disks.push(volume.id);
            self.set_data(
                id,
                HyperstackDataPatch {
                    disks: FieldPatch::Set(disks.clone()),
                    ..Default::default()
                },
            )
            .await?;
        }

        if let Some(vm) = &data.vm {
            tracing::debug!(%id, vm_id = vm.id, "start: starting existing VM");
            self.api.start_virtual_machine(vm.id).await?;
            return Ok(());
        }

        tracing::debug!(%id, "start: no existing VM, creating one");
        let environment_name = self.ensure_environment(config.region_name).await?;
        let key_name = self
            .ensure_key_pair(config.region_name, &environment_name)
            .await?;
        let boot_volume = self.disk_name(id, 0);
        let request = CreateVirtualMachinesRequest {
            name: self.server_name(id),
            environment_name,
            volume_name: boot_volume.clone(),
            key_name,
            flavor_name: config.flavor_name.clone(),
            assign_floating_ip: true,
            security_rules: default_security_rules(),
            count: 1,
        };
        // Creation is rejected until the boot volume exists, which can take
        // a long time in some regions. Only that error class is retried.
        let api = &self.api;
        let vms = retry(
            &self.tuning.vm_create,
            "create virtual machine",
            |err: &HyperstackError| err.is_volume_missing(&boot_volume),
            || api.create_virtual_machines(request.clone()),
        )
        .await
        .map_err(|err| flatten_retry("create virtual machine", err))?;
        let vm = vms
            .into_iter()
            .next()
            .ok_or(HyperstackError::EmptyInstanceList)?;
        let vm_id = vm.id;
        self.set_data(
            id,
            HyperstackDataPatch {
                vm: FieldPatch::Set(vm),
                creation_timestamp: FieldPatch::Set(Utc::now()),
                ..Default::default()
            },
        )
        .await?;

        if disks.len() > 1 {
            tracing::debug!(%id, count = disks.len() - 1, "start: attaching data disks");
            let volume_ids = disks[1..].to_vec();
            // Attach fails until the VM is sufficiently booted.
            retry(
                &self.tuning.volume_attach,
                "attach volumes",
                |_: &HyperstackError| true,
                || api.attach_volumes(vm_id, volume_ids.clone()),
            )
            .await
            .map_err(|err| flatten_retry("attach volumes", err))?;
        }
        Ok(())
    }

    /// Delete the VM and clear its handle, leaving disks intact. Shared by
    /// `stop` and `deprovision`; the caller holds the stop guard.
    async fn stop_inner(&self, server: &ComputeServer) -> Result<()> {
        self.configuration(server)?;
        let Some(vm) = self.data(server)?.and_then(|data| data.vm) else {
            return Ok(());
        };
        tracing::debug!(id = %server.id, vm_id = vm.id, "stop: deleting vm");
        match self.api.delete_virtual_machine(vm.id).await {
            Ok(()) => {}
            // Already gone is information, not failure.
            Err(err) if err.is_not_found() => {
                tracing::debug!(id = %server.id, vm_id = vm.id, "stop: vm already gone");
            }
            Err(err) => return Err(err),
        }
        self.set_data(
            server.id,
            HyperstackDataPatch {
                vm: FieldPatch::Clear,
                ..Default::default()
            },
        )
        .await?;
        Ok(())
    }

    async fn deprovision_inner(&self, server: &ComputeServer) -> Result<()> {
        self.stop_inner(server).await?;
        let disks = self
            .data(server)?
            .and_then(|data| data.disks)
            .unwrap_or_default();
        let mut survivors = Vec::new();
        let mut first_failure: Option<HyperstackError> = None;
        for volume_id in disks {
            let api = &self.api;
            let outcome = retry(
                &self.tuning.volume_delete,
                "delete volume",
                |err: &HyperstackError| !err.is_not_found(),
                || api.delete_volume(volume_id),
            )
            .await;
            match outcome {
                Ok(()) => {
                    tracing::debug!(id = %server.id, %volume_id, "deprovision: deleted volume");
                }
                Err(RetryError::Fatal(err)) if err.is_not_found() => {
                    // Never re-attempt deleting an id that is already gone.
                    tracing::debug!(id = %server.id, %volume_id, "deprovision: volume already gone");
                }
                Err(err) => {
                    let err = flatten_retry("delete volume", err);
                    tracing::warn!(id = %server.id, %volume_id, %err, "deprovision: failed to delete volume");
                    survivors.push(volume_id);
                    first_failure.get_or_insert(err);
                }
            }
        }
        // Persist exactly the still-existing disks so a retry only targets
        // those.
        let disks_patch = if survivors.is_empty() {
            FieldPatch::Clear
        } else {
            FieldPatch::Set(survivors)
        };
        self.set_data(
            server.id,
            HyperstackDataPatch {
                disks: disks_patch,
                ..Default::default()
            },
        )
        .await?;
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn flatten_retry(op: &'static str, err: RetryError<HyperstackError>) -> HyperstackError {
    match err {
        RetryError::Fatal(err) => err,
        RetryError::DeadlineExceeded {
            deadline,
            elapsed,
            last,
        } => HyperstackError::DeadlineExceeded {
            op,
            deadline,
            elapsed,
            last: last.to_string(),
        },
    }
}

#[async_trait]
impl CloudProvider for HyperstackDriver {
    fn cloud(&self) -> Cloud {
        Cloud::Hyperstack
    }

    async fn start(&self, server: &ComputeServer) -> cirrus_cloud::Result<()> {
        let _guard = match self.inflight.begin(server.id, Op::Start) {
            BeginOutcome::Started(guard) => guard,
            BeginOutcome::AlreadyRunning => {
                tracing::debug!(id = %server.id, "start already in flight");
                return Ok(());
            }
            BeginOutcome::Conflict(op) => {
                return Err(CloudError::OperationInFlight { id: server.id, op });
            }
        };
        tracing::debug!(id = %server.id, "start");
        self.start_inner(server).await.map_err(CloudError::from)
    }

    async fn stop(&self, server: &ComputeServer) -> cirrus_cloud::Result<()> {
        let _guard = match self.inflight.begin(server.id, Op::Stop) {
            BeginOutcome::Started(guard) => guard,
            BeginOutcome::AlreadyRunning => {
                tracing::debug!(id = %server.id, "stop already in flight");
                return Ok(());
            }
            BeginOutcome::Conflict(op) => {
                return Err(CloudError::OperationInFlight { id: server.id, op });
            }
        };
        tracing::debug!(id = %server.id, "stop");
        self.stop_inner(server).await.map_err(CloudError::from)
    }

    async fn reboot(&self, server: &ComputeServer) -> cirrus_cloud::Result<()> {
        self.configuration(server).map_err(CloudError::from)?;
        if let Some(op) = self.inflight.busy(server.id) {
            return Err(CloudError::OperationInFlight { id: server.id, op });
        }
        if let Some(vm) = self
            .data(server)
            .map_err(CloudError::from)?
            .and_then(|data| data.vm)
        {
            tracing::debug!(id = %server.id, vm_id = vm.id, "reboot");
            self.api
                .hard_reboot_virtual_machine(vm.id)
                .await
                .map_err(CloudError::from)?;
        }
        Ok(())
    }

    async fn deprovision(&self, server: &ComputeServer) -> cirrus_cloud::Result<()> {
        self.configuration(server).map_err(CloudError::from)?;
        let _guard = match self.inflight.begin(server.id, Op::Stop) {
            BeginOutcome::Started(guard) => guard,
            BeginOutcome::AlreadyRunning => {
                return Err(CloudError::OperationInFlight {
                    id: server.id,
                    op: Op::Stop,
                });
            }
            BeginOutcome::Conflict(op) => {
                return Err(CloudError::OperationInFlight { id: server.id, op });
            }
        };
        tracing::debug!(id = %server.id, "deprovision");
        self.deprovision_inner(server)
            .await
            .map_err(CloudError::from)
    }

    async fn state(&self, server: &ComputeServer) -> cirrus_cloud::Result<State> {
        self.configuration(server).map_err(CloudError::from)?;
        if self.inflight.contains(server.id, Op::Start) {
            return Ok(State::Starting);
        }
        if self.inflight.contains(server.id, Op::Stop) {
            return Ok(State::Stopping);
        }
        let data = match self.data(server) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(id = %server.id, %err, "state: data is wrong for server");
                return Ok(State::Deprovisioned);
            }
        };
        let Some(data) = data else {
            return Ok(State::Deprovisioned);
        };
        let Some(vm) = data.vm else {
            // No known VM resource: either disks exist (off) or nothing
            // does (deprovisioned).
            let disks = data.disks.unwrap_or_default();
            return Ok(if disks.is_empty() {
                State::Deprovisioned
            } else {
                State::Off
            });
        };
        let observed = match self.api.get_virtual_machine(vm.id).await {
            Err(err) if err.is_not_found() => {
                // Authoritative: the handle is dead. Record that and report
                // off; the disks are still there.
                tracing::debug!(id = %server.id, vm_id = vm.id, "state: clearing stale vm handle");
                let patch = HyperstackDataPatch {
                    vm: FieldPatch::Clear,
                    ..Default::default()
                };
                if let Err(store_err) = self.set_data(server.id, patch).await {
                    tracing::warn!(id = %server.id, %store_err, "state: failed to clear vm handle");
                }
                return Ok(State::Off);
            }
            // Network or API trouble: we could not observe the VM, so do
            // not guess a stable state.
            Err(err) => return Err(CloudError::from(err)),
            Ok(vm) => vm,
        };
        let active = observed.is_fully_active();
        self.set_data(
            server.id,
            HyperstackDataPatch {
                vm: FieldPatch::Set(observed),
                ..Default::default()
            },
        )
        .await
        .map_err(CloudError::from)?;
        if active {
            Ok(State::Running)
        } else {
            // The status triple does not distinguish a booting VM from one
            // shutting down; report unknown rather than guess.
            Ok(State::Unknown)
        }
    }

    async fn cost_per_hour(
        &self,
        server: &ComputeServer,
        state: State,
    ) -> cirrus_cloud::Result<f64> {
        let config = self.configuration(server).map_err(CloudError::from)?;
        if state == State::Deprovisioned {
            return Ok(0.0);
        }
        if !state.is_stable() {
            return Err(CloudError::CostUndefined(state));
        }
        let pricing = self.pricing_data().await.map_err(CloudError::from)?;
        compute_cost(&pricing, config, state).map_err(CloudError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Environment, KeyPair, PriceEntry, Volume};
    use cirrus_cloud::MemoryStore;
    use cirrus_cloud::hyperstack::VirtualMachine;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Default)]
    struct MockApi {
        calls: Mutex<Vec<&'static str>>,
        volumes: Mutex<HashMap<i64, String>>,
        vms: Mutex<HashMap<i64, VirtualMachine>>,
        next_id: AtomicI64,
        fail_volume_delete: Mutex<HashSet<i64>>,
        vm_create_rejections: AtomicI64,
        fail_vm_create: Mutex<Option<String>>,
        missing_vms: Mutex<HashSet<i64>>,
    }

    impl MockApi {
        fn new() -> Self {
            Self {
                next_id: AtomicI64::new(100),
                ..Default::default()
            }
        }

        fn record(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }

        fn count(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
        }

        fn api_error(message: impl Into<String>) -> HyperstackError {
            HyperstackError::Api {
                status: Some(400),
                message: message.into(),
            }
        }

        fn active_vm(id: i64, name: &str) -> VirtualMachine {
            VirtualMachine {
                id,
                name: Some(name.to_string()),
                status: Some("ACTIVE".into()),
                power_state: Some("RUNNING".into()),
                vm_state: Some("active".into()),
                flavor: None,
                environment: None,
                keypair: None,
                floating_ip: Some("203.0.113.9".into()),
                fixed_ip: Some("10.0.0.4".into()),
                created_at: None,
            }
        }
    }

    #[async_trait]
    impl HyperstackApi for MockApi {
        async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
            self.record("create_volume");
            // Yield so a concurrent second start can observe the guard.
            tokio::time::sleep(Duration::from_millis(2)).await;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.volumes.lock().unwrap().insert(id, request.name.clone());
            Ok(Volume {
                id: VolumeId(id),
                name: request.name,
                status: Some("available".into()),
            })
        }

        async fn delete_volume(&self, id: VolumeId) -> Result<()> {
            self.record("delete_volume");
            if self.fail_volume_delete.lock().unwrap().contains(&id.0) {
                return Err(Self::api_error("volume is busy"));
            }
            self.volumes.lock().unwrap().remove(&id.0);
            Ok(())
        }

        async fn attach_volumes(&self, _vm_id: i64, _volume_ids: Vec<VolumeId>) -> Result<()> {
            self.record("attach_volumes");
            Ok(())
        }

        async fn create_virtual_machines(
            &self,
            request: CreateVirtualMachinesRequest,
        ) -> Result<Vec<VirtualMachine>> {
            self.record("create_virtual_machines");
            if let Some(message) = self.fail_vm_create.lock().unwrap().clone() {
                return Err(Self::api_error(message));
            }
            if self.vm_create_rejections.load(Ordering::SeqCst) > 0 {
                self.vm_create_rejections.fetch_sub(1, Ordering::SeqCst);
                return Err(Self::api_error(format!(
                    "Volume {} does not exist",
                    request.volume_name
                )));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let vm = Self::active_vm(id, &request.name);
            self.vms.lock().unwrap().insert(id, vm.clone());
            Ok(vec![vm])
        }

        async fn delete_virtual_machine(&self, id: i64) -> Result<()> {
            self.record("delete_virtual_machine");
            self.vms.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn start_virtual_machine(&self, _id: i64) -> Result<()> {
            self.record("start_virtual_machine");
            Ok(())
        }

        async fn hard_reboot_virtual_machine(&self, _id: i64) -> Result<()> {
            self.record("hard_reboot_virtual_machine");
            Ok(())
        }

        async fn get_virtual_machine(&self, id: i64) -> Result<VirtualMachine> {
            self.record("get_virtual_machine");
            if self.missing_vms.lock().unwrap().contains(&id) {
                return Err(Self::api_error("not_found"));
            }
            self.vms
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| Self::api_error("not_found"))
        }

        async fn get_environments(&self) -> Result<Vec<Environment>> {
            self.record("get_environments");
            Ok(Vec::new())
        }

        async fn create_environment(
            &self,
            request: CreateEnvironmentRequest,
        ) -> Result<Environment> {
            self.record("create_environment");
            Ok(Environment {
                id: Some(1),
                name: request.name,
                region: Some(request.region),
            })
        }

        async fn get_key_pairs(&self) -> Result<Vec<KeyPair>> {
            self.record("get_key_pairs");
            Ok(Vec::new())
        }

        async fn import_key_pair(&self, request: ImportKeyPairRequest) -> Result<KeyPair> {
            self.record("import_key_pair");
            Ok(KeyPair {
                name: request.name,
                environment: Some(request.environment_name),
                public_key: Some(request.public_key),
            })
        }

        async fn get_pricebook(&self) -> Result<Vec<PriceEntry>> {
            self.record("get_pricebook");
            Ok(vec![
                PriceEntry {
                    name: "n1-RTX-A4000x1".into(),
                    region_name: Some("CANADA-1".into()),
                    value: "0.53".into(),
                },
                PriceEntry {
                    name: "Cloud-SSD".into(),
                    region_name: None,
                    value: "0.0001".into(),
                },
            ])
        }
    }

    fn fast_tuning() -> DriverTuning {
        let policy = RetryPolicy::new(
            Duration::from_millis(1),
            1.3,
            Duration::from_millis(2),
            Duration::from_millis(30),
        );
        DriverTuning {
            vm_create: policy,
            volume_attach: policy,
            volume_delete: policy,
        }
    }

    fn configuration() -> Configuration {
        Configuration::Hyperstack(HyperstackConfiguration {
            flavor_name: "n1-RTX-A4000x1".into(),
            region_name: Region::Canada1,
            disk_size_gb: 100,
            image: None,
            dns: None,
            ephemeral: false,
        })
    }

    fn harness() -> (Arc<MockApi>, Arc<MemoryStore>, HyperstackDriver, ServerId) {
        let api = Arc::new(MockApi::new());
        let store = Arc::new(MemoryStore::new());
        let id = ServerId(1);
        store.insert(ComputeServer::new(id, "acct", "proj", configuration()));
        let driver = HyperstackDriver::new(api.clone(), store.clone(), DriverSettings::default())
            .with_tuning(fast_tuning());
        (api, store, driver, id)
    }

    async fn server(store: &MemoryStore, id: ServerId) -> ComputeServer {
        store.get_server(id).await.unwrap()
    }

    fn hyperstack_data(server: &ComputeServer) -> HyperstackData {
        match server.data.clone() {
            Some(Data::Hyperstack(data)) => data,
            other => panic!("expected hyperstack data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn start_provisions_disks_and_vm() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        let record = server(&store, id).await;
        let data = hyperstack_data(&record);
        assert_eq!(data.disks.as_ref().unwrap().len(), 2);
        assert!(data.vm.is_some());
        assert_eq!(data.name.as_deref(), Some("cirrus-1"));
        assert_eq!(data.external_ip.as_deref(), Some("203.0.113.9"));
        assert_eq!(api.count("create_volume"), 2);
        assert_eq!(api.count("create_virtual_machines"), 1);
        assert_eq!(api.count("attach_volumes"), 1);
    }

    #[tokio::test]
    async fn start_stop_start_keeps_cloud_tags_consistent() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        driver.stop(&server(&store, id).await).await.unwrap();

        let record = server(&store, id).await;
        let data = hyperstack_data(&record);
        assert_eq!(data.vm, None);
        assert_eq!(data.external_ip, None);
        // Stop never touches disks.
        assert_eq!(data.disks.as_ref().unwrap().len(), 2);
        assert_eq!(api.count("delete_virtual_machine"), 1);
        assert_eq!(api.count("delete_volume"), 0);

        driver.start(&server(&store, id).await).await.unwrap();
        let record = server(&store, id).await;
        let data = hyperstack_data(&record);
        assert!(data.vm.is_some());
        assert_eq!(record.data.as_ref().unwrap().cloud(), record.cloud);
        // The disks were reused, not recreated.
        assert_eq!(api.count("create_volume"), 2);
        assert_eq!(api.count("create_virtual_machines"), 2);
    }

    #[tokio::test]
    async fn concurrent_starts_create_exactly_one_vm() {
        let (api, store, driver, id) = harness();
        let record = server(&store, id).await;
        let (a, b) = tokio::join!(driver.start(&record), driver.start(&record));
        a.unwrap();
        b.unwrap();
        assert_eq!(api.count("create_virtual_machines"), 1);
        assert_eq!(api.count("create_volume"), 2);
    }

    #[tokio::test]
    async fn start_with_existing_vm_issues_provider_start() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        driver.start(&server(&store, id).await).await.unwrap();
        assert_eq!(api.count("create_virtual_machines"), 1);
        assert_eq!(api.count("start_virtual_machine"), 1);
    }

    #[tokio::test]
    async fn vm_creation_retries_while_boot_volume_missing() {
        let (api, store, driver, id) = harness();
        api.vm_create_rejections.store(2, Ordering::SeqCst);
        driver.start(&server(&store, id).await).await.unwrap();
        assert_eq!(api.count("create_virtual_machines"), 3);
        assert!(hyperstack_data(&server(&store, id).await).vm.is_some());
    }

    #[tokio::test]
    async fn vm_creation_aborts_on_unknown_error() {
        let (api, store, driver, id) = harness();
        *api.fail_vm_create.lock().unwrap() = Some("flavor exhausted".into());
        let err = driver.start(&server(&store, id).await).await.unwrap_err();
        assert!(matches!(err, CloudError::Api(_)));
        assert_eq!(api.count("create_virtual_machines"), 1);
    }

    #[tokio::test]
    async fn vm_creation_deadline_is_a_typed_error() {
        let (api, store, driver, id) = harness();
        api.vm_create_rejections.store(i64::MAX, Ordering::SeqCst);
        let err = driver.start(&server(&store, id).await).await.unwrap_err();
        assert!(matches!(err, CloudError::DeadlineExceeded { .. }));
        // Disk ids were persisted before the VM step, so a later retry
        // resumes from there.
        let data = hyperstack_data(&server(&store, id).await);
        assert_eq!(data.disks.as_ref().unwrap().len(), 2);
        assert_eq!(data.vm, None);
    }

    #[tokio::test]
    async fn deprovision_keeps_exactly_the_surviving_disks() {
        let (api, store, driver, id) = harness();
        let mut record = server(&store, id).await;
        record.data = Some(Data::Hyperstack(HyperstackData {
            disks: Some(vec![VolumeId(101), VolumeId(102), VolumeId(103)]),
            ..Default::default()
        }));
        store.insert(record);
        api.fail_volume_delete.lock().unwrap().insert(102);

        let err = driver
            .deprovision(&server(&store, id).await)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::DeadlineExceeded { .. }));
        let data = hyperstack_data(&server(&store, id).await);
        assert_eq!(data.disks, Some(vec![VolumeId(102)]));

        // Once the transient condition clears, a retry only targets the
        // still-existing disk.
        api.fail_volume_delete.lock().unwrap().clear();
        let deletes_so_far = api.count("delete_volume");
        driver
            .deprovision(&server(&store, id).await)
            .await
            .unwrap();
        assert_eq!(api.count("delete_volume"), deletes_so_far + 1);
        assert_eq!(hyperstack_data(&server(&store, id).await).disks, None);
    }

    #[tokio::test]
    async fn state_without_data_is_deprovisioned() {
        let (api, store, driver, id) = harness();
        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Deprovisioned);
        assert_eq!(api.count("get_virtual_machine"), 0);
    }

    #[tokio::test]
    async fn state_with_disks_but_no_vm_is_off() {
        let (_api, store, driver, id) = harness();
        let mut record = server(&store, id).await;
        record.data = Some(Data::Hyperstack(HyperstackData {
            disks: Some(vec![VolumeId(101)]),
            ..Default::default()
        }));
        store.insert(record);
        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Off);
    }

    #[tokio::test]
    async fn state_reports_transient_while_guard_held() {
        let (api, store, driver, id) = harness();
        let _guard = match driver.inflight.begin(id, Op::Start) {
            BeginOutcome::Started(guard) => guard,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Starting);
        // No provider call was made.
        assert_eq!(api.count("get_virtual_machine"), 0);
    }

    #[tokio::test]
    async fn reboot_is_rejected_while_start_in_flight() {
        let (_api, store, driver, id) = harness();
        let _guard = match driver.inflight.begin(id, Op::Start) {
            BeginOutcome::Started(guard) => guard,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let err = driver.reboot(&server(&store, id).await).await.unwrap_err();
        assert!(matches!(
            err,
            CloudError::OperationInFlight { op: Op::Start, .. }
        ));
    }

    #[tokio::test]
    async fn state_clears_a_vanished_vm_handle() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        let vm_id = hyperstack_data(&server(&store, id).await).vm.unwrap().id;
        api.missing_vms.lock().unwrap().insert(vm_id);

        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Off);
        let data = hyperstack_data(&server(&store, id).await);
        assert_eq!(data.vm, None);
        assert_eq!(data.external_ip, None);
        assert_eq!(data.disks.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn state_maps_the_status_triple() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Running);

        let vm_id = hyperstack_data(&server(&store, id).await).vm.unwrap().id;
        api.vms.lock().unwrap().get_mut(&vm_id).unwrap().power_state = Some("SHUTOFF".into());
        // Anything short of the fully-active triple is ambiguous.
        let state = driver.state(&server(&store, id).await).await.unwrap();
        assert_eq!(state, State::Unknown);
    }

    #[tokio::test]
    async fn state_persists_the_observed_snapshot() {
        let (api, store, driver, id) = harness();
        driver.start(&server(&store, id).await).await.unwrap();
        let vm_id = hyperstack_data(&server(&store, id).await).vm.unwrap().id;
        api.vms.lock().unwrap().get_mut(&vm_id).unwrap().floating_ip =
            Some("198.51.100.23".into());

        driver.state(&server(&store, id).await).await.unwrap();
        let data = hyperstack_data(&server(&store, id).await);
        assert_eq!(data.external_ip.as_deref(), Some("198.51.100.23"));
        assert_eq!(
            data.vm.unwrap().floating_ip.as_deref(),
            Some("198.51.100.23")
        );
    }

    #[tokio::test]
    async fn cost_of_deprovisioned_is_zero() {
        let (api, store, driver, id) = harness();
        let cost = driver
            .cost_per_hour(&server(&store, id).await, State::Deprovisioned)
            .await
            .unwrap();
        assert_eq!(cost, 0.0);
        assert_eq!(api.count("get_pricebook"), 0);
    }

    #[tokio::test]
    async fn cost_running_uses_the_cached_pricebook() {
        let (api, store, driver, id) = harness();
        let record = server(&store, id).await;
        let cost = driver
            .cost_per_hour(&record, State::Running)
            .await
            .unwrap();
        assert!((cost - (0.53 + 150.0 * 0.0001)).abs() < 1e-12);
        driver
            .cost_per_hour(&record, State::Off)
            .await
            .unwrap();
        assert_eq!(api.count("get_pricebook"), 1);
    }

    #[tokio::test]
    async fn cost_of_transient_state_is_undefined() {
        let (_api, store, driver, id) = harness();
        let err = driver
            .cost_per_hour(&server(&store, id).await, State::Starting)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::CostUndefined(State::Starting)));
    }

    #[tokio::test]
    async fn environment_and_key_pair_lookups_are_cached() {
        let (api, store, driver, _id) = harness();
        store.insert(ComputeServer::new(ServerId(2), "acct", "proj", configuration()));
        driver.start(&server(&store, ServerId(1)).await).await.unwrap();
        driver.start(&server(&store, ServerId(2)).await).await.unwrap();
        assert_eq!(api.count("get_environments"), 1);
        assert_eq!(api.count("create_environment"), 1);
        assert_eq!(api.count("get_key_pairs"), 1);
        assert_eq!(api.count("import_key_pair"), 1);
    }

    #[tokio::test]
    async fn records_from_other_clouds_are_rejected() {
        let (_api, store, driver, _id) = harness();
        let id = ServerId(3);
        store.insert(ComputeServer::new(
            id,
            "acct",
            "proj",
            Configuration::GoogleCloud(cirrus_cloud::google::GoogleCloudConfiguration {
                region: "us-west1".into(),
                zone: "us-west1-a".into(),
                machine_type: "n2-standard-4".into(),
                spot: false,
                disk_size_gb: None,
                source_image: None,
            }),
        ));
        let err = driver.start(&server(&store, id).await).await.unwrap_err();
        assert!(matches!(
            err,
            CloudError::WrongCloud {
                expected: Cloud::Hyperstack,
                got: Cloud::GoogleCloud,
            }
        ));
    }
}
