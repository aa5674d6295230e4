use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::libvirt::DomainHandle;
use crate::core::vm::VmState;
use crate::errors::{CoordinatorError, CoordinatorResult, GpuError, VmError};
use crate::gpu::allocator::GpuResourceAllocator;
use crate::gpu::pci::PciAddress;
use crate::state::file_manager::StateStore;
use crate::state::models::{
    ClusterKind, ClusterState, GpuOwner, NetworkConfig, NetworkInfo, PersistedState, VmInfo,
};

/// Disagreement between the VM records and the live allocation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// A VM records the device but the table has no owner for it.
    MissingFromTable {
        pci_address: PciAddress,
        recorded_owner: GpuOwner,
    },
    /// The table has an owner no VM record backs.
    UnexpectedInTable {
        pci_address: PciAddress,
        owner: GpuOwner,
    },
    OwnerMismatch {
        pci_address: PciAddress,
        recorded_owner: GpuOwner,
        table_owner: GpuOwner,
    },
    DuplicateAssignment {
        pci_address: PciAddress,
        owners: Vec<GpuOwner>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub cluster: ClusterKind,
    pub name: String,
    pub total_vms: usize,
    pub running: usize,
    pub by_state: BTreeMap<VmState, usize>,
    pub gpus_assigned: usize,
    pub failed_vms: Vec<String>,
}

/// What [`ClusterStateManager::upsert_vm`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmUpsert {
    Created,
    Updated,
    Unchanged,
}

/// A VM left mid-transition by a previous process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterruptedVm {
    pub cluster: ClusterKind,
    pub vm: String,
    pub state: VmState,
}

/// Authoritative in-memory model of both clusters.
///
/// Every mutation runs against a staged copy which is persisted before it
/// replaces the live state, so a failed write leaves nothing behind.
pub struct ClusterStateManager {
    state: PersistedState,
    store: Box<dyn StateStore>,
    allocator: Arc<GpuResourceAllocator>,
}

fn vm_mut<'a>(
    state: &'a mut PersistedState,
    cluster: ClusterKind,
    vm: &str,
) -> CoordinatorResult<&'a mut VmInfo> {
    state
        .clusters
        .get_mut(&cluster)
        .ok_or(VmError::ClusterNotFound(cluster))?
        .vm_mut(vm)
        .ok_or_else(|| {
            VmError::NotFound {
                cluster,
                vm: vm.to_string(),
            }
            .into()
        })
}

fn touch(state: &mut PersistedState, cluster: ClusterKind, at: DateTime<Utc>) {
    if let Some(c) = state.clusters.get_mut(&cluster) {
        c.last_modified = at;
    }
}

/// First VM other than `except` that records `addr`.
fn recorded_elsewhere(
    state: &PersistedState,
    addr: &PciAddress,
    except: &GpuOwner,
) -> Option<GpuOwner> {
    state
        .gpu_assignments()
        .find(|(a, owner)| *a == addr && owner != except)
        .map(|(_, owner)| owner)
}

impl ClusterStateManager {
    pub fn new(
        state: PersistedState,
        store: Box<dyn StateStore>,
        allocator: Arc<GpuResourceAllocator>,
    ) -> Self {
        Self {
            state,
            store,
            allocator,
        }
    }

    pub fn allocator(&self) -> &Arc<GpuResourceAllocator> {
        &self.allocator
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.clone()
    }

    fn commit<R>(
        &mut self,
        f: impl FnOnce(&mut PersistedState) -> CoordinatorResult<R>,
    ) -> CoordinatorResult<R> {
        let mut staged = self.state.clone();
        let result = f(&mut staged)?;
        if let Err(e) = self.store.save(&staged) {
            warn!(error = %e, "State write failed, change rolled back");
            return Err(CoordinatorError::Persistence(e));
        }
        self.state = staged;
        Ok(result)
    }

    pub fn get_cluster(&self, cluster: ClusterKind) -> CoordinatorResult<&ClusterState> {
        self.state
            .clusters
            .get(&cluster)
            .ok_or_else(|| VmError::ClusterNotFound(cluster).into())
    }

    pub fn vm(&self, cluster: ClusterKind, vm: &str) -> CoordinatorResult<&VmInfo> {
        self.get_cluster(cluster)?.vm(vm).ok_or_else(|| {
            VmError::NotFound {
                cluster,
                vm: vm.to_string(),
            }
            .into()
        })
    }

    /// Create an empty cluster if none exists yet. Returns whether it did.
    pub fn ensure_cluster(
        &mut self,
        cluster: ClusterKind,
        name: &str,
        network: Option<NetworkConfig>,
    ) -> CoordinatorResult<bool> {
        if let Some(existing) = self.state.clusters.get(&cluster) {
            if network.is_none() || existing.network == network {
                return Ok(false);
            }
            self.commit(|state| {
                if let Some(c) = state.clusters.get_mut(&cluster) {
                    c.network = network;
                    c.last_modified = Utc::now();
                }
                Ok(())
            })?;
            return Ok(false);
        }

        self.commit(|state| {
            state
                .clusters
                .insert(cluster, ClusterState::new(cluster, name, network));
            Ok(())
        })?;
        info!(cluster = %cluster, name, "Cluster created");
        Ok(true)
    }

    /// Insert a new VM record, or update the declared shape of an existing
    /// one (role, resources, declared devices, auto-start, volume).
    ///
    /// Runtime fields of an existing record are never replaced: its state,
    /// owned devices, domain handle, network and error stay as recorded. A
    /// new record must start `undefined` with nothing attached.
    pub fn upsert_vm(&mut self, cluster: ClusterKind, info: VmInfo) -> CoordinatorResult<VmUpsert> {
        let current = self.get_cluster(cluster)?.vm(&info.name).cloned();

        let Some(current) = current else {
            if info.state != VmState::Undefined {
                return Err(CoordinatorError::Validation(format!(
                    "new VM {} must start undefined, not {}",
                    info.name, info.state
                )));
            }
            if !info.gpus.is_empty() || info.domain_handle.is_some() {
                return Err(CoordinatorError::Validation(format!(
                    "new VM {} cannot own GPUs or a hypervisor domain",
                    info.name
                )));
            }
            let name = info.name.clone();
            self.commit(|state| {
                let c = state
                    .clusters
                    .get_mut(&cluster)
                    .ok_or(VmError::ClusterNotFound(cluster))?;
                c.vms.push(info);
                c.last_modified = Utc::now();
                Ok(())
            })?;
            debug!(cluster = %cluster, vm = %name, "VM record created");
            return Ok(VmUpsert::Created);
        };

        let merged = VmInfo {
            role: info.role,
            resources: info.resources,
            declared_gpus: info.declared_gpus,
            auto_start: info.auto_start,
            volume_path: info.volume_path,
            ..current.clone()
        };
        if merged == current {
            return Ok(VmUpsert::Unchanged);
        }
        self.commit(|state| {
            let c = state
                .clusters
                .get_mut(&cluster)
                .ok_or(VmError::ClusterNotFound(cluster))?;
            if let Some(existing) = c.vm_mut(&merged.name) {
                *existing = merged;
            }
            c.last_modified = Utc::now();
            Ok(())
        })?;
        debug!(cluster = %cluster, vm = %current.name, "VM declared shape updated");
        Ok(VmUpsert::Updated)
    }

    /// Apply one step of the lifecycle table. Returns the previous state.
    pub fn transition_vm(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
        to: VmState,
        at: DateTime<Utc>,
    ) -> CoordinatorResult<VmState> {
        let from = self.commit(|state| {
            let info = vm_mut(state, cluster, vm)?;
            let from = info.state;
            if !from.can_transition_to(to) {
                return Err(VmError::InvalidTransition {
                    vm: vm.to_string(),
                    from,
                    to,
                }
                .into());
            }
            info.state = to;
            info.last_transition = at;
            if to != VmState::Error {
                info.last_error = None;
            }
            touch(state, cluster, at);
            Ok(from)
        })?;
        info!(cluster = %cluster, vm, from = %from, to = %to, "VM transition recorded");
        Ok(from)
    }

    /// Move to `error` and keep the message, in one write.
    pub fn fail_vm(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> CoordinatorResult<VmState> {
        let from = self.commit(|state| {
            let info = vm_mut(state, cluster, vm)?;
            let from = info.state;
            if !from.can_transition_to(VmState::Error) {
                return Err(VmError::InvalidTransition {
                    vm: vm.to_string(),
                    from,
                    to: VmState::Error,
                }
                .into());
            }
            info.state = VmState::Error;
            info.last_error = Some(message.to_string());
            info.last_transition = at;
            touch(state, cluster, at);
            Ok(from)
        })?;
        warn!(cluster = %cluster, vm, from = %from, error = message, "VM moved to error");
        Ok(from)
    }

    /// Record devices the allocator has already reserved for this VM.
    pub fn record_gpu_assignment(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
        addresses: &[PciAddress],
    ) -> CoordinatorResult<()> {
        let owner = GpuOwner::new(cluster, vm);

        for addr in addresses {
            match self.allocator.owner_of(addr) {
                Some(table_owner) if table_owner != owner => {
                    return Err(GpuError::Conflict {
                        pci_address: addr.clone(),
                        owner: table_owner,
                    }
                    .into());
                }
                Some(_) => {}
                None => {
                    return Err(CoordinatorError::Validation(format!(
                        "GPU {addr} is not reserved for {owner}"
                    )));
                }
            }
            if let Some(other) = recorded_elsewhere(&self.state, addr, &owner) {
                return Err(GpuError::Conflict {
                    pci_address: addr.clone(),
                    owner: other,
                }
                .into());
            }
        }

        self.commit(|state| {
            let info = vm_mut(state, cluster, vm)?;
            for addr in addresses {
                if !info.gpus.contains(addr) {
                    info.gpus.push(addr.clone());
                }
            }
            info.gpus.sort();
            touch(state, cluster, Utc::now());
            Ok(())
        })?;
        for addr in addresses {
            info!(cluster = %cluster, vm, pci_address = %addr, "GPU assignment recorded");
        }
        Ok(())
    }

    /// Drop the VM's recorded devices. The allocator is not touched.
    pub fn clear_gpu_assignment(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
    ) -> CoordinatorResult<Vec<PciAddress>> {
        if self.vm(cluster, vm)?.gpus.is_empty() {
            return Ok(Vec::new());
        }
        self.commit(|state| {
            let info = vm_mut(state, cluster, vm)?;
            let cleared = std::mem::take(&mut info.gpus);
            touch(state, cluster, Utc::now());
            Ok(cleared)
        })
    }

    pub fn set_domain_handle(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
        handle: Option<DomainHandle>,
    ) -> CoordinatorResult<()> {
        self.commit(|state| {
            vm_mut(state, cluster, vm)?.domain_handle = handle;
            touch(state, cluster, Utc::now());
            Ok(())
        })
    }

    pub fn set_network_info(
        &mut self,
        cluster: ClusterKind,
        vm: &str,
        network: NetworkInfo,
    ) -> CoordinatorResult<()> {
        if self.vm(cluster, vm)?.network == network {
            return Ok(());
        }
        self.commit(|state| {
            vm_mut(state, cluster, vm)?.network = network;
            touch(state, cluster, Utc::now());
            Ok(())
        })
    }

    /// Remove a destroyed (or never defined) VM record entirely.
    pub fn forget_vm(&mut self, cluster: ClusterKind, vm: &str) -> CoordinatorResult<VmInfo> {
        let current = self.vm(cluster, vm)?;
        if !matches!(current.state, VmState::Destroyed | VmState::Undefined) {
            return Err(CoordinatorError::Validation(format!(
                "VM {vm} is {} and must be destroyed before it can be forgotten",
                current.state
            )));
        }
        if !current.gpus.is_empty() {
            return Err(CoordinatorError::Validation(format!(
                "VM {vm} still records {} GPU(s)",
                current.gpus.len()
            )));
        }

        let removed = self.commit(|state| {
            let c = state
                .clusters
                .get_mut(&cluster)
                .ok_or(VmError::ClusterNotFound(cluster))?;
            let idx = c.vms.iter().position(|v| v.name == vm).ok_or_else(|| {
                CoordinatorError::from(VmError::NotFound {
                    cluster,
                    vm: vm.to_string(),
                })
            })?;
            c.last_modified = Utc::now();
            Ok(c.vms.remove(idx))
        })?;
        info!(cluster = %cluster, vm, "VM record forgotten");
        Ok(removed)
    }

    /// Rebuild the table from VM records and diff it against the allocator.
    pub fn verify_integrity(&self) -> Vec<IntegrityIssue> {
        let (scanned, duplicates) = self.state.scan_allocations();
        let live = self.allocator.allocations();
        let mut issues = Vec::new();

        for (pci_address, owners) in duplicates {
            issues.push(IntegrityIssue::DuplicateAssignment { pci_address, owners });
        }

        for (addr, recorded_owner) in &scanned {
            match live.get(addr) {
                None => issues.push(IntegrityIssue::MissingFromTable {
                    pci_address: addr.clone(),
                    recorded_owner: recorded_owner.clone(),
                }),
                Some(table_owner) if table_owner != recorded_owner => {
                    issues.push(IntegrityIssue::OwnerMismatch {
                        pci_address: addr.clone(),
                        recorded_owner: recorded_owner.clone(),
                        table_owner: table_owner.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        for (addr, owner) in live {
            if !scanned.contains_key(&addr) {
                issues.push(IntegrityIssue::UnexpectedInTable {
                    pci_address: addr,
                    owner,
                });
            }
        }

        if !issues.is_empty() {
            warn!(issues = issues.len(), "Allocation table disagrees with VM records");
        }
        issues
    }

    pub fn cluster_status(&self, cluster: ClusterKind) -> CoordinatorResult<ClusterStatus> {
        let c = self.get_cluster(cluster)?;
        let mut by_state: BTreeMap<VmState, usize> = BTreeMap::new();
        for vm in &c.vms {
            *by_state.entry(vm.state).or_default() += 1;
        }
        Ok(ClusterStatus {
            cluster,
            name: c.name.clone(),
            total_vms: c.vms.len(),
            running: by_state.get(&VmState::Running).copied().unwrap_or(0),
            by_state,
            gpus_assigned: c.vms.iter().map(|vm| vm.gpus.len()).sum(),
            failed_vms: c
                .vms
                .iter()
                .filter(|vm| vm.state == VmState::Error)
                .map(|vm| vm.name.clone())
                .collect(),
        })
    }

    pub fn interrupted_vms(&self) -> Vec<InterruptedVm> {
        self.state
            .clusters
            .values()
            .flat_map(|c| {
                c.vms
                    .iter()
                    .filter(|vm| vm.state.is_transitional())
                    .map(move |vm| InterruptedVm {
                        cluster: c.kind,
                        vm: vm.name.clone(),
                        state: vm.state,
                    })
            })
            .collect()
    }
}
