#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cluster_gpu_coordinator::config::cluster::{
    ClustersConfig, CloudClusterConfig, HpcClusterConfig, MergedConfig, NodeConfig, PciDevice,
    PciePassthrough,
};
use cluster_gpu_coordinator::config::{generate_default_config, Settings};
use cluster_gpu_coordinator::core::libvirt::{
    DomainHandle, Hypervisor, HypervisorError, HypervisorState,
};
use cluster_gpu_coordinator::core::vm::VmSpec;
use cluster_gpu_coordinator::gpu::pci::PciAddress;
use cluster_gpu_coordinator::state::models::{NetworkConfig, NetworkInfo};
use cluster_gpu_coordinator::Coordinator;

pub const HPC_VM: &str = "hpc-compute-01";
pub const CLOUD_VM: &str = "cloud-gpu-worker-01";

/// Records every call; individual operations can be made to fail or stall.
#[derive(Default)]
pub struct MockHypervisor {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    domains: Mutex<HashMap<String, HypervisorState>>,
}

impl MockHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, domain: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').nth(1) == Some(domain))
            .collect()
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn heal(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn stall(&self, operation: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(operation, delay);
    }

    pub fn set_domain_state(&self, domain: &str, state: HypervisorState) {
        self.domains.lock().unwrap().insert(domain.to_string(), state);
    }

    async fn step(&self, operation: &'static str, detail: String) -> Result<(), HypervisorError> {
        self.calls.lock().unwrap().push(format!("{operation} {detail}"));
        let delay = self.delays.lock().unwrap().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(HypervisorError::Command {
                operation,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn set(&self, domain: &DomainHandle, state: HypervisorState) {
        self.set_domain_state(domain.as_str(), state);
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define(&self, spec: &VmSpec) -> Result<DomainHandle, HypervisorError> {
        self.step("define", spec.name.clone()).await?;
        let handle = DomainHandle(spec.name.clone());
        self.set(&handle, HypervisorState::Shutoff);
        Ok(handle)
    }

    async fn start(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.step("start", domain.to_string()).await?;
        self.set(domain, HypervisorState::Running);
        Ok(())
    }

    async fn pause(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.step("pause", domain.to_string()).await?;
        self.set(domain, HypervisorState::Paused);
        Ok(())
    }

    async fn resume(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.step("resume", domain.to_string()).await?;
        self.set(domain, HypervisorState::Running);
        Ok(())
    }

    async fn stop(&self, domain: &DomainHandle, graceful: bool) -> Result<(), HypervisorError> {
        self.step("stop", format!("{domain} graceful={graceful}")).await?;
        self.set(domain, HypervisorState::Shutoff);
        Ok(())
    }

    async fn destroy(&self, domain: &DomainHandle) -> Result<(), HypervisorError> {
        self.step("destroy", domain.to_string()).await?;
        self.domains.lock().unwrap().remove(domain.as_str());
        Ok(())
    }

    async fn attach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError> {
        self.step("attach_device", format!("{domain} {device}")).await
    }

    async fn detach_device(
        &self,
        domain: &DomainHandle,
        device: &PciAddress,
    ) -> Result<(), HypervisorError> {
        self.step("detach_device", format!("{domain} {device}")).await
    }

    async fn query_state(&self, domain: &DomainHandle) -> Result<HypervisorState, HypervisorError> {
        self.step("query_state", domain.to_string()).await?;
        Ok(self
            .domains
            .lock()
            .unwrap()
            .get(domain.as_str())
            .copied()
            .unwrap_or(HypervisorState::Missing))
    }

    async fn interface_addresses(
        &self,
        domain: &DomainHandle,
    ) -> Result<Option<NetworkInfo>, HypervisorError> {
        self.step("interface_addresses", domain.to_string()).await?;
        Ok(Some(NetworkInfo {
            ip_address: Some("192.168.100.11".to_string()),
            mac_address: Some("52:54:00:6b:3c:58".to_string()),
        }))
    }
}

pub fn settings(dir: &Path) -> Settings {
    let mut settings = generate_default_config();
    settings.state.path = dir.join("state.json");
    settings.state.max_backups = 3;
    settings.hypervisor.call_timeout_secs = 1;
    settings.hypervisor.timeout_retries = 0;
    settings.hypervisor.retry_backoff_ms = 10;
    settings
}

pub fn addr(raw: &str) -> PciAddress {
    PciAddress::parse(raw).unwrap()
}

fn node(gpus: &[&str]) -> NodeConfig {
    NodeConfig {
        name: None,
        cpu_cores: 4,
        memory_gb: 16,
        auto_start: false,
        volume_path: None,
        pcie_passthrough: Some(PciePassthrough {
            enabled: !gpus.is_empty(),
            devices: gpus
                .iter()
                .map(|a| PciDevice {
                    pci_address: a.to_string(),
                    device_type: "gpu".to_string(),
                    vendor_id: Some("10de".to_string()),
                    device_id: Some("2204".to_string()),
                })
                .collect(),
        }),
    }
}

fn network(subnet: &str, bridge: &str) -> NetworkConfig {
    NetworkConfig {
        subnet: subnet.to_string(),
        bridge: bridge.to_string(),
        dhcp_start: None,
        dhcp_end: None,
        dns_servers: vec!["1.1.1.1".to_string()],
    }
}

/// One HPC compute node and one cloud GPU worker, each with the given GPUs.
pub fn cluster_config(hpc_gpus: &[&str], cloud_gpus: &[&str]) -> MergedConfig {
    MergedConfig {
        clusters: ClustersConfig {
            hpc: Some(HpcClusterConfig {
                name: "hpc".to_string(),
                network: network("192.168.100.0/24", "virbr100"),
                storage_pool: None,
                controller: Some(node(&[])),
                compute_nodes: vec![node(hpc_gpus)],
            }),
            cloud: Some(CloudClusterConfig {
                name: "cloud".to_string(),
                network: network("192.168.200.0/24", "virbr200"),
                storage_pool: None,
                control_plane: Some(node(&[])),
                worker_nodes: BTreeMap::from([("gpu".to_string(), vec![node(cloud_gpus)])]),
            }),
        },
    }
}

/// Open a coordinator on `dir` and populate it from `config`.
pub async fn populated(
    dir: &Path,
    hypervisor: Arc<MockHypervisor>,
    config: &MergedConfig,
) -> Coordinator {
    let coordinator = Coordinator::open(settings(dir), hypervisor).unwrap();
    coordinator.populate_from_config(config).await.unwrap();
    coordinator
}
