use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::info;

use crate::config::cluster::MergedConfig;
use crate::gpu::pci::PciAddress;
use crate::state::models::ClusterKind;

/// Static pre-flight check over a merged configuration. Never touches the
/// live allocation table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedGpuValidator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GpuSummary {
    pub total: usize,
    pub shared: usize,
    pub exclusive: usize,
    pub all: BTreeMap<PciAddress, BTreeSet<ClusterKind>>,
}

impl SharedGpuValidator {
    /// Which clusters declare each GPU address. Unparseable addresses are
    /// skipped here; [`MergedConfig::validate`] reports them.
    pub fn usage(&self, config: &MergedConfig) -> BTreeMap<PciAddress, BTreeSet<ClusterKind>> {
        let mut usage: BTreeMap<PciAddress, BTreeSet<ClusterKind>> = BTreeMap::new();
        for vm in config.declared_vms() {
            for addr in vm.node.raw_gpu_addresses().filter_map(|raw| PciAddress::parse(raw).ok()) {
                usage.entry(addr).or_default().insert(vm.cluster);
            }
        }
        usage
    }

    /// Addresses declared by more than one cluster.
    pub fn detect_shared_gpus(
        &self,
        config: &MergedConfig,
    ) -> BTreeMap<PciAddress, BTreeSet<ClusterKind>> {
        let mut shared = self.usage(config);
        shared.retain(|_, clusters| clusters.len() > 1);
        if !shared.is_empty() {
            let addresses: Vec<&str> = shared.keys().map(PciAddress::as_str).collect();
            info!(shared = ?addresses, "Detected GPUs declared by both clusters");
        }
        shared
    }

    pub fn gpu_summary(&self, config: &MergedConfig) -> GpuSummary {
        let all = self.usage(config);
        let shared = all.values().filter(|c| c.len() > 1).count();
        GpuSummary {
            total: all.len(),
            shared,
            exclusive: all.len() - shared,
            all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cluster::tests::merged;

    #[test]
    fn reports_device_declared_by_both_clusters() {
        let config = merged(&["0000:01:00.0"], &["0000:01:00.0"]);
        let shared = SharedGpuValidator.detect_shared_gpus(&config);

        let addr = PciAddress::parse("0000:01:00.0").unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(
            shared[&addr],
            BTreeSet::from([ClusterKind::Hpc, ClusterKind::Cloud])
        );
    }

    #[test]
    fn disjoint_devices_are_not_shared() {
        let config = merged(&["0000:01:00.0"], &["0000:02:00.0"]);
        assert!(SharedGpuValidator.detect_shared_gpus(&config).is_empty());
    }

    #[test]
    fn reuse_within_one_cluster_is_not_cross_cluster_sharing() {
        let mut config = merged(&["0000:01:00.0"], &[]);
        if let Some(hpc) = config.clusters.hpc.as_mut() {
            let second = hpc.compute_nodes[0].clone();
            hpc.compute_nodes.push(second);
        }
        assert!(SharedGpuValidator.detect_shared_gpus(&config).is_empty());
    }

    #[test]
    fn summary_counts() {
        let config = merged(&["0000:01:00.0", "0000:81:00.0"], &["01:00.0", "0000:02:00.0"]);
        let summary = SharedGpuValidator.gpu_summary(&config);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.shared, 1);
        assert_eq!(summary.exclusive, 2);
    }
}
