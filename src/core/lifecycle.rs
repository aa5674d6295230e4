//! VM lifecycle driver.
//!
//! Every request follows the same shape: take the coordination lock, validate
//! and record the intermediate state (reserving GPUs for a start), release the
//! lock, call the hypervisor, then take the lock again to commit the outcome.
//! The intermediate state doubles as a per-VM guard: a second request for a
//! VM that is `starting` is rejected by the transition table.
//!
//! When the hypervisor has answered but the outcome cannot be written, the VM
//! is moved to `error` where possible. If even that write fails the VM stays
//! in its intermediate state with no operation in flight, and a request for
//! `destroyed` forces cleanup from there.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, instrument, warn};

use crate::core::libvirt::{DomainHandle, Hypervisor, HypervisorError, HypervisorState};
use crate::core::vm::{VmSpec, VmState};
use crate::errors::handlers::CollaboratorGuard;
use crate::errors::{CoordinatorError, CoordinatorResult, VmError};
use crate::gpu::allocator::GpuResourceAllocator;
use crate::gpu::pci::PciAddress;
use crate::state::cluster_state::ClusterStateManager;
use crate::state::models::{ClusterKind, VmInfo};

/// Result of best-effort cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cleanup", rename_all = "snake_case")]
pub enum CleanupOutcome {
    Complete,
    /// The transition went through but some cleanup steps failed.
    Partial { failures: Vec<String> },
}

impl CleanupOutcome {
    fn from_failures(failures: Vec<String>) -> Self {
        if failures.is_empty() {
            Self::Complete
        } else {
            Self::Partial { failures }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub cluster: ClusterKind,
    pub vm: String,
    pub from: VmState,
    pub to: VmState,
    /// Devices returned to the pool by this transition.
    pub released: Vec<PciAddress>,
    pub cleanup: CleanupOutcome,
}

/// Recorded state that the hypervisor does not confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub cluster: ClusterKind,
    pub vm: String,
    pub recorded: VmState,
    pub observed: Option<HypervisorState>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    Define,
    Start,
    Resume,
    Pause,
    Stop,
    /// `defined -> stopped`, nothing to tell the hypervisor.
    NoopStop,
    Destroy,
    ForceDestroy,
}

impl Plan {
    /// Like [`Plan::for_request`], but a VM stuck in an intermediate state
    /// with nothing in flight can still be force-destroyed.
    fn select(from: VmState, target: VmState, in_flight: bool) -> Option<Self> {
        Self::for_request(from, target).or_else(|| {
            let stuck = from.is_transitional() && !in_flight;
            (stuck && target == VmState::Destroyed).then_some(Self::ForceDestroy)
        })
    }

    fn for_request(from: VmState, target: VmState) -> Option<Self> {
        use VmState::*;
        match (from, target) {
            (Undefined, Defined) => Some(Self::Define),
            (Defined | Stopped, Running) => Some(Self::Start),
            (Paused, Running) => Some(Self::Resume),
            (Running, Paused) => Some(Self::Pause),
            (Running, Stopped) => Some(Self::Stop),
            (Defined, Stopped) => Some(Self::NoopStop),
            (Defined | Stopped, Destroyed) => Some(Self::Destroy),
            (Error, Destroyed) => Some(Self::ForceDestroy),
            _ => None,
        }
    }
}

type StateGuard<'a> = RwLockWriteGuard<'a, ClusterStateManager>;

type VmKey = (ClusterKind, String);

/// VMs with a request between its first and last state write.
#[derive(Default)]
struct InFlight(Mutex<HashSet<VmKey>>);

impl InFlight {
    fn contains(&self, cluster: ClusterKind, vm: &str) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(cluster, vm.to_string()))
    }

    fn enter(&self, cluster: ClusterKind, vm: &str) -> InFlightEntry<'_> {
        let key = (cluster, vm.to_string());
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        InFlightEntry { set: self, key }
    }
}

/// Removes its VM from the in-flight set when dropped, including when the
/// request future is cancelled.
struct InFlightEntry<'a> {
    set: &'a InFlight,
    key: VmKey,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        self.set
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Pass `result` through; on error try to park the VM in `error` so it is
/// not left in an intermediate state nobody will finish.
fn park_on_failure<T>(
    state: &mut ClusterStateManager,
    cluster: ClusterKind,
    vm: &str,
    result: CoordinatorResult<T>,
) -> CoordinatorResult<T> {
    if let Err(e) = &result {
        let message = format!("outcome not recorded: {e}");
        if let Err(persist) = state.fail_vm(cluster, vm, &message, Utc::now()) {
            error!(cluster = %cluster, vm, error = %persist, "VM left in intermediate state");
        }
    }
    result
}

pub struct VmLifecycleManager {
    state: Arc<RwLock<ClusterStateManager>>,
    allocator: Arc<GpuResourceAllocator>,
    hypervisor: Arc<dyn Hypervisor>,
    guard: CollaboratorGuard,
    graceful_stop: bool,
    in_flight: InFlight,
}

fn handle_of(info: &VmInfo) -> CoordinatorResult<DomainHandle> {
    info.domain_handle.clone().ok_or_else(|| {
        CoordinatorError::Validation(format!("VM {} has no hypervisor domain", info.name))
    })
}

impl VmLifecycleManager {
    pub fn new(
        state: Arc<RwLock<ClusterStateManager>>,
        allocator: Arc<GpuResourceAllocator>,
        hypervisor: Arc<dyn Hypervisor>,
        guard: CollaboratorGuard,
        graceful_stop: bool,
    ) -> Self {
        Self {
            state,
            allocator,
            hypervisor,
            guard,
            graceful_stop,
            in_flight: InFlight::default(),
        }
    }

    /// Drive `vm` to the stable state `target`.
    #[instrument(skip(self), fields(op_id = %uuid::Uuid::new_v4()))]
    pub async fn request_transition(
        &self,
        cluster: ClusterKind,
        vm: &str,
        target: VmState,
    ) -> CoordinatorResult<TransitionOutcome> {
        let state = self.state.write().await;
        let info = state.vm(cluster, vm)?.clone();
        let busy = self.in_flight.contains(cluster, vm);
        let plan = Plan::select(info.state, target, busy).ok_or_else(|| {
            warn!(from = %info.state, busy, "Transition rejected");
            VmError::InvalidTransition {
                vm: vm.to_string(),
                from: info.state,
                to: target,
            }
        })?;
        debug!(?plan, from = %info.state, "Transition accepted");
        let _in_flight = self.in_flight.enter(cluster, vm);

        match plan {
            Plan::Define => self.define(state, cluster, info).await,
            Plan::Start => self.start(state, cluster, info).await,
            Plan::Resume => self.resume(state, cluster, info).await,
            Plan::Pause => self.pause(state, cluster, info).await,
            Plan::Stop => self.stop(state, cluster, info).await,
            Plan::NoopStop => self.noop_stop(state, cluster, info),
            Plan::Destroy => self.destroy(state, cluster, info).await,
            Plan::ForceDestroy => self.force_destroy(state, cluster, info).await,
        }
    }

    /// Stop (when running) and start again.
    pub async fn restart(
        &self,
        cluster: ClusterKind,
        vm: &str,
    ) -> CoordinatorResult<Vec<TransitionOutcome>> {
        let current = self.state.read().await.vm(cluster, vm)?.state;
        let mut outcomes = Vec::new();
        if current == VmState::Running {
            outcomes.push(self.request_transition(cluster, vm, VmState::Stopped).await?);
        }
        outcomes.push(self.request_transition(cluster, vm, VmState::Running).await?);
        Ok(outcomes)
    }

    pub async fn forget(&self, cluster: ClusterKind, vm: &str) -> CoordinatorResult<VmInfo> {
        self.state.write().await.forget_vm(cluster, vm)
    }

    /// Compare recorded states with what the hypervisor reports. Read-only.
    pub async fn detect_drift(&self) -> Vec<DriftReport> {
        let candidates: Vec<(ClusterKind, String, VmState, DomainHandle)> = {
            let snapshot = self.state.read().await.snapshot();
            snapshot
                .clusters
                .values()
                .flat_map(|c| {
                    c.vms.iter().filter_map(move |vm| {
                        vm.domain_handle
                            .clone()
                            .map(|h| (c.kind, vm.name.clone(), vm.state, h))
                    })
                })
                .collect()
        };

        let mut reports = Vec::new();
        for (cluster, vm, recorded, handle) in candidates {
            match self
                .guard
                .call("query_state", || self.hypervisor.query_state(&handle))
                .await
            {
                Ok(observed) if observed.agrees_with(recorded) => {}
                Ok(observed) => {
                    warn!(cluster = %cluster, vm = %vm, recorded = %recorded, ?observed, "State drift");
                    reports.push(DriftReport {
                        cluster,
                        vm,
                        recorded,
                        observed: Some(observed),
                        error: None,
                    });
                }
                Err(e) => reports.push(DriftReport {
                    cluster,
                    vm,
                    recorded,
                    observed: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        reports
    }

    /// Record a collaborator failure against the VM and build the error.
    async fn fail(&self, cluster: ClusterKind, vm: &str, err: HypervisorError) -> CoordinatorError {
        let message = err.to_string();
        let mut state = self.state.write().await;
        if let Err(persist) = state.fail_vm(cluster, vm, &message, Utc::now()) {
            error!(cluster = %cluster, vm, error = %persist, "Could not record VM failure");
        }
        CoordinatorError::collaborator(vm, err)
    }

    /// Commit the final state of a request after the hypervisor answered.
    async fn settle(&self, cluster: ClusterKind, vm: &str, to: VmState) -> CoordinatorResult<()> {
        let mut state = self.state.write().await;
        let recorded = state.transition_vm(cluster, vm, to, Utc::now());
        park_on_failure(&mut state, cluster, vm, recorded).map(|_| ())
    }

    /// Drop the recorded devices, then return them to the pool. Nothing is
    /// released when the record cannot be written.
    fn release_devices(
        &self,
        state: &mut ClusterStateManager,
        cluster: ClusterKind,
        vm: &str,
    ) -> CoordinatorResult<BTreeSet<PciAddress>> {
        state.clear_gpu_assignment(cluster, vm)?;
        Ok(self.allocator.release(cluster, vm))
    }

    fn outcome(
        cluster: ClusterKind,
        info: &VmInfo,
        to: VmState,
        released: BTreeSet<PciAddress>,
        cleanup: CleanupOutcome,
    ) -> TransitionOutcome {
        TransitionOutcome {
            cluster,
            vm: info.name.clone(),
            from: info.state,
            to,
            released: released.into_iter().collect(),
            cleanup,
        }
    }

    async fn define(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        let bridge = state
            .get_cluster(cluster)?
            .network
            .as_ref()
            .map(|n| n.bridge.clone());
        state.transition_vm(cluster, &info.name, VmState::Defining, Utc::now())?;
        drop(state);

        let spec = VmSpec {
            name: info.name.clone(),
            cluster,
            role: info.role,
            resources: info.resources.clone(),
            gpus: info.declared_gpus.clone(),
            bridge,
            volume_path: info.volume_path.clone(),
        };
        let handle = match self
            .guard
            .call("define", || self.hypervisor.define(&spec))
            .await
        {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(cluster, &info.name, e).await),
        };

        let mut state = self.state.write().await;
        let recorded = state
            .set_domain_handle(cluster, &info.name, Some(handle))
            .and_then(|()| state.transition_vm(cluster, &info.name, VmState::Defined, Utc::now()));
        park_on_failure(&mut state, cluster, &info.name, recorded)?;
        Ok(Self::outcome(cluster, &info, VmState::Defined, BTreeSet::new(), CleanupOutcome::Complete))
    }

    async fn start(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        let handle = handle_of(&info)?;

        // Denied here means nothing was touched and the hypervisor is never called.
        let reservation = self
            .allocator
            .reserve(cluster, &info.name, &info.declared_gpus)?;

        if let Err(e) = state.transition_vm(cluster, &info.name, VmState::Starting, Utc::now()) {
            self.allocator.cancel(&reservation);
            return Err(e);
        }
        let gpus: Vec<PciAddress> = reservation.addresses.iter().cloned().collect();
        if let Err(e) = state.record_gpu_assignment(cluster, &info.name, &gpus) {
            self.allocator.cancel(&reservation);
            return park_on_failure(&mut state, cluster, &info.name, Err(e));
        }
        drop(state);

        let mut attached: Vec<&PciAddress> = Vec::new();
        let mut failure = None;
        for addr in &gpus {
            match self
                .guard
                .call("attach_device", || self.hypervisor.attach_device(&handle, addr))
                .await
            {
                Ok(()) => attached.push(addr),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            if let Err(e) = self
                .guard
                .call("start", || self.hypervisor.start(&handle))
                .await
            {
                failure = Some(e);
            }
        }

        if let Some(err) = failure {
            for addr in attached {
                if let Err(e) = self
                    .guard
                    .call("detach_device", || self.hypervisor.detach_device(&handle, addr))
                    .await
                {
                    warn!(pci_address = %addr, error = %e, "Detach during rollback failed");
                }
            }
            let mut state = self.state.write().await;
            match state.clear_gpu_assignment(cluster, &info.name) {
                Ok(_) => {
                    let released = self.allocator.release(cluster, &info.name);
                    info!(vm = %info.name, released = released.len(), "Start failed, reservations rolled back");
                }
                // record and table still agree; forced destroy releases them later
                Err(e) => error!(vm = %info.name, error = %e, "Start failed, GPUs kept"),
            }
            drop(state);
            return Err(self.fail(cluster, &info.name, err).await);
        }

        self.settle(cluster, &info.name, VmState::Running).await?;

        self.refresh_network(cluster, &info.name, &handle).await;
        Ok(Self::outcome(cluster, &info, VmState::Running, BTreeSet::new(), CleanupOutcome::Complete))
    }

    /// Opportunistic: failures are logged and otherwise ignored.
    async fn refresh_network(&self, cluster: ClusterKind, vm: &str, handle: &DomainHandle) {
        match self
            .guard
            .call("interface_addresses", || self.hypervisor.interface_addresses(handle))
            .await
        {
            Ok(Some(network)) => {
                if let Err(e) = self.state.write().await.set_network_info(cluster, vm, network) {
                    warn!(vm, error = %e, "Could not record network info");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(vm, error = %e, "No interface addresses yet"),
        }
    }

    async fn resume(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        let handle = handle_of(&info)?;
        state.transition_vm(cluster, &info.name, VmState::Starting, Utc::now())?;
        drop(state);

        if let Err(e) = self
            .guard
            .call("resume", || self.hypervisor.resume(&handle))
            .await
        {
            return Err(self.fail(cluster, &info.name, e).await);
        }

        self.settle(cluster, &info.name, VmState::Running).await?;
        Ok(Self::outcome(cluster, &info, VmState::Running, BTreeSet::new(), CleanupOutcome::Complete))
    }

    async fn pause(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        let handle = handle_of(&info)?;
        state.transition_vm(cluster, &info.name, VmState::Pausing, Utc::now())?;
        drop(state);

        if let Err(e) = self
            .guard
            .call("pause", || self.hypervisor.pause(&handle))
            .await
        {
            return Err(self.fail(cluster, &info.name, e).await);
        }

        self.settle(cluster, &info.name, VmState::Paused).await?;
        Ok(Self::outcome(cluster, &info, VmState::Paused, BTreeSet::new(), CleanupOutcome::Complete))
    }

    async fn stop(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        let handle = handle_of(&info)?;
        state.transition_vm(cluster, &info.name, VmState::Stopping, Utc::now())?;
        drop(state);

        let graceful = self.graceful_stop;
        if let Err(e) = self
            .guard
            .call("stop", || self.hypervisor.stop(&handle, graceful))
            .await
        {
            // the VM may still be using its devices, so they stay owned
            return Err(self.fail(cluster, &info.name, e).await);
        }

        let failures = self.detach_all(&handle, &info.gpus).await;

        let mut state = self.state.write().await;
        let recorded = self.release_devices(&mut state, cluster, &info.name).and_then(|released| {
            state.transition_vm(cluster, &info.name, VmState::Stopped, Utc::now())?;
            Ok(released)
        });
        let released = park_on_failure(&mut state, cluster, &info.name, recorded)?;
        Ok(Self::outcome(
            cluster,
            &info,
            VmState::Stopped,
            released,
            CleanupOutcome::from_failures(failures),
        ))
    }

    fn noop_stop(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        state.transition_vm(cluster, &info.name, VmState::Stopping, Utc::now())?;
        let stopped = state.transition_vm(cluster, &info.name, VmState::Stopped, Utc::now());
        park_on_failure(&mut state, cluster, &info.name, stopped)?;
        Ok(Self::outcome(cluster, &info, VmState::Stopped, BTreeSet::new(), CleanupOutcome::Complete))
    }

    async fn detach_all(&self, handle: &DomainHandle, gpus: &[PciAddress]) -> Vec<String> {
        let mut failures = Vec::new();
        for addr in gpus {
            if let Err(e) = self
                .guard
                .call("detach_device", || self.hypervisor.detach_device(handle, addr))
                .await
            {
                warn!(pci_address = %addr, error = %e, "GPU detach failed");
                failures.push(format!("detach {addr}: {e}"));
            }
        }
        failures
    }

    async fn destroy(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        state.transition_vm(cluster, &info.name, VmState::Destroying, Utc::now())?;
        drop(state);

        if let Some(handle) = &info.domain_handle {
            if let Err(e) = self
                .guard
                .call("destroy", || self.hypervisor.destroy(handle))
                .await
            {
                return Err(self.fail(cluster, &info.name, e).await);
            }
        }

        self.finish_destroy(cluster, &info, CleanupOutcome::Complete).await
    }

    /// Cleanup from `error`, or from an intermediate state nothing is
    /// driving: every step is attempted, failures are reported but do not
    /// stop the VM from reaching `destroyed`.
    async fn force_destroy(
        &self,
        mut state: StateGuard<'_>,
        cluster: ClusterKind,
        info: VmInfo,
    ) -> CoordinatorResult<TransitionOutcome> {
        if info.state.is_transitional() {
            let message = format!("stuck while {}, forcing cleanup", info.state);
            state.fail_vm(cluster, &info.name, &message, Utc::now())?;
        }
        state.transition_vm(cluster, &info.name, VmState::Destroying, Utc::now())?;
        drop(state);

        let mut failures = Vec::new();
        if let Some(handle) = &info.domain_handle {
            let observed = self
                .guard
                .call("query_state", || self.hypervisor.query_state(handle))
                .await;
            let running = !matches!(
                observed,
                Ok(HypervisorState::Shutoff) | Ok(HypervisorState::Missing)
            );
            if running {
                if let Err(e) = self
                    .guard
                    .call("stop", || self.hypervisor.stop(handle, false))
                    .await
                {
                    warn!(vm = %info.name, error = %e, "Forced stop failed");
                    failures.push(format!("stop: {e}"));
                }
            }

            failures.extend(self.detach_all(handle, &info.gpus).await);

            if let Err(e) = self
                .guard
                .call("destroy", || self.hypervisor.destroy(handle))
                .await
            {
                warn!(vm = %info.name, error = %e, "Forced destroy failed");
                failures.push(format!("destroy: {e}"));
            }
        }

        self.finish_destroy(cluster, &info, CleanupOutcome::from_failures(failures))
            .await
    }

    async fn finish_destroy(
        &self,
        cluster: ClusterKind,
        info: &VmInfo,
        cleanup: CleanupOutcome,
    ) -> CoordinatorResult<TransitionOutcome> {
        let mut state = self.state.write().await;
        let recorded = self.release_devices(&mut state, cluster, &info.name).and_then(|released| {
            state.set_domain_handle(cluster, &info.name, None)?;
            state.transition_vm(cluster, &info.name, VmState::Destroyed, Utc::now())?;
            Ok(released)
        });
        let released = park_on_failure(&mut state, cluster, &info.name, recorded)?;
        if let CleanupOutcome::Partial { failures } = &cleanup {
            warn!(vm = %info.name, failures = failures.len(), "VM destroyed with partial cleanup");
        }
        Ok(Self::outcome(cluster, info, VmState::Destroyed, released, cleanup))
    }
}
