use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::libvirt::DomainHandle;
use crate::core::vm::{VmResources, VmState};
use crate::gpu::pci::PciAddress;

/// Highest state schema this build can read and the one it writes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Hpc,
    Cloud,
}

impl ClusterKind {
    pub const ALL: [ClusterKind; 2] = [ClusterKind::Hpc, ClusterKind::Cloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hpc => "hpc",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClusterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hpc" => Ok(Self::Hpc),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown cluster '{other}', expected hpc or cloud")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmRole {
    Controller,
    Compute,
    ControlPlane,
    Worker,
}

/// Owner of a GPU in the allocation table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GpuOwner {
    pub cluster: ClusterKind,
    pub vm: String,
}

impl GpuOwner {
    pub fn new(cluster: ClusterKind, vm: impl Into<String>) -> Self {
        Self {
            cluster,
            vm: vm.into(),
        }
    }
}

impl fmt::Display for GpuOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.vm)
    }
}

/// Live GPU ownership: PCI address -> owner.
pub type AllocationTable = BTreeMap<PciAddress, GpuOwner>;

/// Cluster-level declared network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub subnet: String,
    pub bridge: String,
    #[serde(default)]
    pub dhcp_start: Option<String>,
    #[serde(default)]
    pub dhcp_end: Option<String>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Addresses observed for one VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInfo {
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmInfo {
    pub name: String,
    pub role: VmRole,
    pub state: VmState,
    pub resources: VmResources,
    /// Devices the configuration asks for; reserved on every start.
    pub declared_gpus: Vec<PciAddress>,
    /// Devices this VM currently owns in the allocation table.
    pub gpus: Vec<PciAddress>,
    pub network: NetworkInfo,
    pub auto_start: bool,
    pub domain_handle: Option<DomainHandle>,
    /// Boot disk image handed to the hypervisor at define time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_path: Option<PathBuf>,
    pub last_transition: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl VmInfo {
    pub fn new(name: impl Into<String>, role: VmRole) -> Self {
        Self {
            name: name.into(),
            role,
            state: VmState::Undefined,
            resources: VmResources::default(),
            declared_gpus: Vec::new(),
            gpus: Vec::new(),
            network: NetworkInfo::default(),
            auto_start: false,
            domain_handle: None,
            volume_path: None,
            last_transition: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_declared_gpus(mut self, gpus: Vec<PciAddress>) -> Self {
        self.declared_gpus = gpus;
        self
    }

    pub fn with_resources(mut self, resources: VmResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_volume(mut self, path: Option<PathBuf>) -> Self {
        self.volume_path = path;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterState {
    pub kind: ClusterKind,
    pub name: String,
    pub vms: Vec<VmInfo>,
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl ClusterState {
    pub fn new(kind: ClusterKind, name: impl Into<String>, network: Option<NetworkConfig>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            name: name.into(),
            vms: Vec::new(),
            network,
            metadata: BTreeMap::new(),
            schema_version: STATE_SCHEMA_VERSION,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn vm(&self, name: &str) -> Option<&VmInfo> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn vm_mut(&mut self, name: &str) -> Option<&mut VmInfo> {
        self.vms.iter_mut().find(|vm| vm.name == name)
    }

    pub fn duplicate_vm_names(&self) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        self.vms
            .iter()
            .filter(|vm| !seen.insert(vm.name.as_str()))
            .map(|vm| vm.name.clone())
            .collect()
    }
}

/// Everything persisted on the control host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistedState {
    pub schema_version: u32,
    pub clusters: BTreeMap<ClusterKind, ClusterState>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            clusters: BTreeMap::new(),
        }
    }
}

impl PersistedState {
    /// Walk every VM's assigned GPUs, in cluster then VM order.
    pub fn gpu_assignments(&self) -> impl Iterator<Item = (&PciAddress, GpuOwner)> + '_ {
        self.clusters.values().flat_map(|cluster| {
            cluster.vms.iter().flat_map(move |vm| {
                vm.gpus
                    .iter()
                    .map(move |addr| (addr, GpuOwner::new(cluster.kind, vm.name.clone())))
            })
        })
    }

    /// Rebuild the allocation table from the VM records. Returns the table and
    /// any address claimed by more than one VM.
    pub fn scan_allocations(&self) -> (AllocationTable, BTreeMap<PciAddress, Vec<GpuOwner>>) {
        let mut table = AllocationTable::new();
        let mut claims: BTreeMap<PciAddress, Vec<GpuOwner>> = BTreeMap::new();

        for (addr, owner) in self.gpu_assignments() {
            claims.entry(addr.clone()).or_default().push(owner.clone());
            table.entry(addr.clone()).or_insert(owner);
        }

        claims.retain(|_, owners| owners.len() > 1);
        (table, claims)
    }
}
