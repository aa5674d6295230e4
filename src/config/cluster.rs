//! Merged cluster configuration: both clusters' declared VMs, devices and
//! networks, as produced by the provisioning tooling.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use config::{Config, File};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::vm::VmResources;
use crate::errors::{CoordinatorError, CoordinatorResult};
use crate::gpu::pci::PciAddress;
use crate::state::models::{ClusterKind, NetworkConfig, VmInfo, VmRole};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedConfig {
    pub clusters: ClustersConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClustersConfig {
    #[serde(default)]
    pub hpc: Option<HpcClusterConfig>,
    #[serde(default)]
    pub cloud: Option<CloudClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpcClusterConfig {
    pub name: String,
    pub network: NetworkConfig,
    /// Directory holding `<vm>.qcow2` boot disks for nodes without an explicit volume.
    #[serde(default)]
    pub storage_pool: Option<PathBuf>,
    #[serde(default)]
    pub controller: Option<NodeConfig>,
    #[serde(default)]
    pub compute_nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudClusterConfig {
    pub name: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage_pool: Option<PathBuf>,
    #[serde(default)]
    pub control_plane: Option<NodeConfig>,
    /// Worker groups, e.g. `cpu` and `gpu`.
    #[serde(default)]
    pub worker_nodes: BTreeMap<String, Vec<NodeConfig>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub cpu_cores: u32,
    pub memory_gb: u32,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub pcie_passthrough: Option<PciePassthrough>,
    #[serde(default)]
    pub volume_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PciePassthrough {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub devices: Vec<PciDevice>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PciDevice {
    pub pci_address: String,
    pub device_type: String,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// One VM as the configuration declares it, with its default name resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredVm {
    pub cluster: ClusterKind,
    pub name: String,
    pub role: VmRole,
    pub node: NodeConfig,
    pub volume_path: Option<PathBuf>,
}

impl DeclaredVm {
    pub fn to_vm_info(&self) -> CoordinatorResult<VmInfo> {
        let mut info = VmInfo::new(self.name.clone(), self.role)
            .with_resources(VmResources {
                cpu_cores: self.node.cpu_cores,
                memory_gb: self.node.memory_gb,
            })
            .with_declared_gpus(self.node.gpu_addresses()?)
            .with_volume(self.volume_path.clone());
        info.auto_start = self.node.auto_start;
        Ok(info)
    }
}

impl NodeConfig {
    /// Raw GPU addresses, only when passthrough is enabled.
    pub fn raw_gpu_addresses(&self) -> impl Iterator<Item = &str> {
        self.pcie_passthrough
            .iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.devices.iter())
            .filter(|d| d.device_type == "gpu")
            .map(|d| d.pci_address.as_str())
    }

    pub fn gpu_addresses(&self) -> CoordinatorResult<Vec<PciAddress>> {
        let mut out = Vec::new();
        for raw in self.raw_gpu_addresses() {
            let addr = PciAddress::parse(raw)?;
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
        Ok(out)
    }
}

impl MergedConfig {
    pub fn from_file(path: &Path) -> CoordinatorResult<Self> {
        info!("Loading cluster configuration from {}", path.display());
        let config = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn cluster_name(&self, kind: ClusterKind) -> Option<&str> {
        match kind {
            ClusterKind::Hpc => self.clusters.hpc.as_ref().map(|c| c.name.as_str()),
            ClusterKind::Cloud => self.clusters.cloud.as_ref().map(|c| c.name.as_str()),
        }
    }

    pub fn network(&self, kind: ClusterKind) -> Option<&NetworkConfig> {
        match kind {
            ClusterKind::Hpc => self.clusters.hpc.as_ref().map(|c| &c.network),
            ClusterKind::Cloud => self.clusters.cloud.as_ref().map(|c| &c.network),
        }
    }

    /// Every declared VM with its resolved name, in a stable order.
    ///
    /// Unnamed nodes get `<cluster>-controller`, `<cluster>-compute-NN`,
    /// `<cluster>-control-plane` or `<cluster>-<group>-worker-NN`. A node
    /// without its own `volume_path` boots from `<storage_pool>/<name>.qcow2`
    /// when the cluster has a pool.
    pub fn declared_vms(&self) -> Vec<DeclaredVm> {
        let mut vms = Vec::new();

        if let Some(hpc) = &self.clusters.hpc {
            let hpc_pool = hpc.storage_pool.as_deref();
            if let Some(node) = &hpc.controller {
                vms.push(declared(ClusterKind::Hpc, node, VmRole::Controller, hpc_pool, || {
                    format!("{}-controller", hpc.name)
                }));
            }
            for (i, node) in hpc.compute_nodes.iter().enumerate() {
                vms.push(declared(ClusterKind::Hpc, node, VmRole::Compute, hpc_pool, || {
                    format!("{}-compute-{:02}", hpc.name, i + 1)
                }));
            }
        }

        if let Some(cloud) = &self.clusters.cloud {
            let cloud_pool = cloud.storage_pool.as_deref();
            if let Some(node) = &cloud.control_plane {
                vms.push(declared(ClusterKind::Cloud, node, VmRole::ControlPlane, cloud_pool, || {
                    format!("{}-control-plane", cloud.name)
                }));
            }
            for (group, nodes) in &cloud.worker_nodes {
                for (i, node) in nodes.iter().enumerate() {
                    vms.push(declared(ClusterKind::Cloud, node, VmRole::Worker, cloud_pool, || {
                        format!("{}-{group}-worker-{:02}", cloud.name, i + 1)
                    }));
                }
            }
        }

        vms
    }

    /// Addresses must parse and VM names must be unique per cluster.
    pub fn validate(&self) -> CoordinatorResult<()> {
        let mut names: BTreeSet<(ClusterKind, String)> = BTreeSet::new();
        for vm in self.declared_vms() {
            for raw in vm.node.raw_gpu_addresses() {
                PciAddress::parse(raw).map_err(|_| {
                    CoordinatorError::Validation(format!(
                        "VM {} declares invalid PCI address '{raw}'",
                        vm.name
                    ))
                })?;
            }
            if !names.insert((vm.cluster, vm.name.clone())) {
                return Err(CoordinatorError::Validation(format!(
                    "VM name '{}' declared twice in cluster {}",
                    vm.name, vm.cluster
                )));
            }
        }
        Ok(())
    }
}

fn declared(
    cluster: ClusterKind,
    node: &NodeConfig,
    role: VmRole,
    pool: Option<&Path>,
    default_name: impl FnOnce() -> String,
) -> DeclaredVm {
    let name = node.name.clone().unwrap_or_else(default_name);
    let volume_path = node
        .volume_path
        .clone()
        .or_else(|| pool.map(|p| p.join(format!("{name}.qcow2"))));
    DeclaredVm {
        cluster,
        name,
        role,
        node: node.clone(),
        volume_path,
    }
}
