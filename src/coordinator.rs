use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::cluster::MergedConfig;
use crate::config::settings::{Settings, StateSettings};
use crate::core::libvirt::Hypervisor;
use crate::core::lifecycle::{DriftReport, TransitionOutcome, VmLifecycleManager};
use crate::core::vm::VmState;
use crate::errors::handlers::CollaboratorGuard;
use crate::errors::{CoordinatorError, CoordinatorResult, StateError};
use crate::gpu::allocator::GpuResourceAllocator;
use crate::gpu::pci::PciAddress;
use crate::gpu::validator::{GpuSummary, SharedGpuValidator};
use crate::state::cluster_state::{ClusterStateManager, ClusterStatus, IntegrityIssue, VmUpsert};
use crate::state::file_manager::{StateFileManager, StateStore};
use crate::state::models::{AllocationTable, ClusterKind, ClusterState, PersistedState, VmInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    /// GPU addresses declared by more than one cluster.
    pub shared: BTreeMap<PciAddress, BTreeSet<ClusterKind>>,
    pub summary: GpuSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulateReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Entry point for callers: wires state, allocator and lifecycle together.
pub struct Coordinator {
    settings: Settings,
    state: Arc<RwLock<ClusterStateManager>>,
    allocator: Arc<GpuResourceAllocator>,
    lifecycle: VmLifecycleManager,
    validator: SharedGpuValidator,
}

impl Coordinator {
    /// Open the state file named in `settings`. A missing file starts empty;
    /// a corrupted one is an error and is never silently replaced.
    pub fn open(settings: Settings, hypervisor: Arc<dyn Hypervisor>) -> CoordinatorResult<Self> {
        let store = StateFileManager::new(&settings.state.path, settings.state.max_backups);
        match store.clean_stale_temp_files() {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Cleaned up temporary files from an interrupted save"),
            Err(e) => warn!(error = %e, "Could not scan for stale temporary files"),
        }
        Self::with_store(settings, Box::new(store), hypervisor)
    }

    pub fn with_store(
        settings: Settings,
        store: Box<dyn StateStore>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> CoordinatorResult<Self> {
        let state = match store.load() {
            Ok(state) => state,
            Err(StateError::NotFound(what)) => {
                info!("No state at {what}, starting empty");
                PersistedState::default()
            }
            Err(e) => {
                error!(error = %e, "Failed to load state");
                return Err(e.into());
            }
        };

        let (table, duplicates) = state.scan_allocations();
        if let Some((addr, owners)) = duplicates.into_iter().next() {
            return Err(StateError::Format(format!(
                "GPU {addr} is recorded for {} VMs",
                owners.len()
            ))
            .into());
        }

        let allocator = Arc::new(GpuResourceAllocator::from_table(table));
        let mut manager = ClusterStateManager::new(state, store, allocator.clone());

        let issues = manager.verify_integrity();
        if !issues.is_empty() {
            warn!(issues = issues.len(), "Integrity issues found at startup");
        }

        if settings.state.recover_interrupted {
            for stuck in manager.interrupted_vms() {
                let message = format!("interrupted while {} by a previous run", stuck.state);
                manager.fail_vm(stuck.cluster, &stuck.vm, &message, Utc::now())?;
                warn!(cluster = %stuck.cluster, vm = %stuck.vm, was = %stuck.state, "Recovered interrupted VM into error");
            }
        }

        let state = Arc::new(RwLock::new(manager));
        let lifecycle = VmLifecycleManager::new(
            state.clone(),
            allocator.clone(),
            hypervisor,
            CollaboratorGuard::from_settings(&settings.hypervisor),
            settings.hypervisor.graceful_stop,
        );

        Ok(Self {
            settings,
            state,
            allocator,
            lifecycle,
            validator: SharedGpuValidator,
        })
    }

    /// Replace the live state file with its newest verifiable backup. Offline
    /// only: run it before opening a coordinator on the same file.
    pub fn restore_latest_backup(
        settings: &StateSettings,
    ) -> CoordinatorResult<(PathBuf, PersistedState)> {
        let store = StateFileManager::new(&settings.path, settings.max_backups);
        Ok(store.restore_latest_backup()?)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn run_preflight_validation(&self, config: &MergedConfig) -> CoordinatorResult<PreflightReport> {
        config.validate()?;
        Ok(PreflightReport {
            shared: self.validator.detect_shared_gpus(config),
            summary: self.validator.gpu_summary(config),
        })
    }

    /// Create clusters and VM records for everything the configuration
    /// declares. Existing VMs keep their runtime state; only their declared
    /// shape is updated.
    pub async fn populate_from_config(&self, config: &MergedConfig) -> CoordinatorResult<PopulateReport> {
        let preflight = self.run_preflight_validation(config)?;
        if !preflight.shared.is_empty() && !self.settings.allocation.allow_shared_gpus {
            let addresses: Vec<&str> = preflight.shared.keys().map(PciAddress::as_str).collect();
            return Err(CoordinatorError::Validation(format!(
                "GPUs declared by both clusters: {}",
                addresses.join(", ")
            )));
        }

        let mut state = self.state.write().await;
        for kind in ClusterKind::ALL {
            if let Some(name) = config.cluster_name(kind) {
                state.ensure_cluster(kind, name, config.network(kind).cloned())?;
            }
        }

        let mut report = PopulateReport::default();
        for declared in config.declared_vms() {
            let fresh = declared.to_vm_info()?;
            match state.upsert_vm(declared.cluster, fresh)? {
                VmUpsert::Created => report.created.push(declared.name),
                VmUpsert::Updated => report.updated.push(declared.name),
                VmUpsert::Unchanged => report.unchanged.push(declared.name),
            }
        }

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            "Cluster state populated from configuration"
        );
        Ok(report)
    }

    pub async fn request_transition(
        &self,
        cluster: ClusterKind,
        vm: &str,
        target: VmState,
    ) -> CoordinatorResult<TransitionOutcome> {
        self.lifecycle.request_transition(cluster, vm, target).await
    }

    pub async fn restart(
        &self,
        cluster: ClusterKind,
        vm: &str,
    ) -> CoordinatorResult<Vec<TransitionOutcome>> {
        self.lifecycle.restart(cluster, vm).await
    }

    pub async fn forget_vm(&self, cluster: ClusterKind, vm: &str) -> CoordinatorResult<VmInfo> {
        self.lifecycle.forget(cluster, vm).await
    }

    pub async fn detect_drift(&self) -> Vec<DriftReport> {
        self.lifecycle.detect_drift().await
    }

    pub async fn get_cluster_snapshot(&self, cluster: ClusterKind) -> CoordinatorResult<ClusterState> {
        Ok(self.state.read().await.get_cluster(cluster)?.clone())
    }

    pub async fn snapshot(&self) -> PersistedState {
        self.state.read().await.snapshot()
    }

    pub async fn cluster_status(&self, cluster: ClusterKind) -> CoordinatorResult<ClusterStatus> {
        self.state.read().await.cluster_status(cluster)
    }

    pub fn list_gpu_allocations(&self) -> AllocationTable {
        self.allocator.allocations()
    }

    pub async fn verify_integrity(&self) -> Vec<IntegrityIssue> {
        self.state.read().await.verify_integrity()
    }
}
