use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::GpuError;
use crate::gpu::pci::PciAddress;
use crate::state::models::{AllocationTable, ClusterKind, GpuOwner};

/// A binding claim on a set of devices, taken before the hypervisor confirms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub owner: GpuOwner,
    /// Everything the VM holds after the reservation.
    pub addresses: BTreeSet<PciAddress>,
    /// The subset that was free before this reservation.
    pub newly_reserved: BTreeSet<PciAddress>,
}

/// Live device ownership for both clusters. One instance per process.
///
/// The table lock is only held for short synchronous sections, never across
/// an await point.
#[derive(Debug, Default)]
pub struct GpuResourceAllocator {
    table: RwLock<AllocationTable>,
}

impl GpuResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a scan of persisted VM records.
    pub fn from_table(table: AllocationTable) -> Self {
        info!(allocated = table.len(), "GPU allocation table rebuilt");
        Self {
            table: RwLock::new(table),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AllocationTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AllocationTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve every requested address for `vm`, or none of them.
    pub fn reserve(
        &self,
        cluster: ClusterKind,
        vm: &str,
        addresses: &[PciAddress],
    ) -> Result<Reservation, GpuError> {
        let requester = GpuOwner::new(cluster, vm);
        let wanted: BTreeSet<PciAddress> = addresses.iter().cloned().collect();
        let mut table = self.write();

        for addr in &wanted {
            if let Some(owner) = table.get(addr) {
                if *owner != requester {
                    warn!(
                        pci_address = %addr,
                        owner = %owner,
                        requester = %requester,
                        "GPU reservation denied"
                    );
                    return Err(GpuError::Denied {
                        pci_address: addr.clone(),
                        owner: owner.clone(),
                        requester,
                    });
                }
            }
        }

        let mut newly_reserved = BTreeSet::new();
        for addr in &wanted {
            if !table.contains_key(addr) {
                table.insert(addr.clone(), requester.clone());
                newly_reserved.insert(addr.clone());
            }
        }

        let held: BTreeSet<PciAddress> = table
            .iter()
            .filter(|(_, owner)| **owner == requester)
            .map(|(addr, _)| addr.clone())
            .collect();

        debug!(
            owner = %requester,
            newly = newly_reserved.len(),
            held = held.len(),
            "GPU reservation granted"
        );

        Ok(Reservation {
            owner: requester,
            addresses: held,
            newly_reserved,
        })
    }

    /// Undo exactly what `reservation` newly took. Addresses that changed
    /// hands since are left alone.
    pub fn cancel(&self, reservation: &Reservation) {
        let mut table = self.write();
        for addr in &reservation.newly_reserved {
            if table.get(addr) == Some(&reservation.owner) {
                table.remove(addr);
            }
        }
        debug!(owner = %reservation.owner, "GPU reservation cancelled");
    }

    /// Free everything `vm` holds. Releasing a VM with nothing is a no-op.
    pub fn release(&self, cluster: ClusterKind, vm: &str) -> BTreeSet<PciAddress> {
        let owner = GpuOwner::new(cluster, vm);
        let mut table = self.write();
        let freed: BTreeSet<PciAddress> = table
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &freed {
            table.remove(addr);
        }
        if !freed.is_empty() {
            info!(owner = %owner, released = freed.len(), "Released GPUs");
        }
        freed
    }

    pub fn owner_of(&self, address: &PciAddress) -> Option<GpuOwner> {
        self.read().get(address).cloned()
    }

    pub fn allocations(&self) -> AllocationTable {
        self.read().clone()
    }

    pub fn held_by(&self, cluster: ClusterKind, vm: &str) -> BTreeSet<PciAddress> {
        let owner = GpuOwner::new(cluster, vm);
        self.read()
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn is_available(&self, address: &PciAddress) -> bool {
        !self.read().contains_key(address)
    }

    /// Non-binding pre-check. The answer can be stale by the time the caller
    /// acts on it; only [`reserve`](Self::reserve) is authoritative.
    pub fn check_availability(
        &self,
        cluster: ClusterKind,
        vm: &str,
        addresses: &[PciAddress],
    ) -> Result<(), GpuError> {
        let requester = GpuOwner::new(cluster, vm);
        let table = self.read();
        match addresses
            .iter()
            .find_map(|addr| table.get(addr).filter(|o| **o != requester).map(|o| (addr, o)))
        {
            Some((addr, owner)) => Err(GpuError::Denied {
                pci_address: addr.clone(),
                owner: owner.clone(),
                requester,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> PciAddress {
        PciAddress::parse(s).unwrap()
    }

    #[test]
    fn reserve_is_all_or_nothing() {
        let alloc = GpuResourceAllocator::new();
        alloc
            .reserve(ClusterKind::Cloud, "cloud-gpu-worker-01", &[addr("0000:02:00.0")])
            .unwrap();

        let err = alloc
            .reserve(
                ClusterKind::Hpc,
                "hpc-compute-01",
                &[addr("0000:01:00.0"), addr("0000:02:00.0")],
            )
            .unwrap_err();
        assert!(matches!(err, GpuError::Denied { ref pci_address, .. } if pci_address.as_str() == "0000:02:00.0"));

        // the free device was not taken either
        assert!(alloc.is_available(&addr("0000:01:00.0")));
        assert_eq!(alloc.allocations().len(), 1);
    }

    #[test]
    fn re_reserving_own_devices_is_granted() {
        let alloc = GpuResourceAllocator::new();
        let first = alloc
            .reserve(ClusterKind::Hpc, "n1", &[addr("0000:01:00.0"), addr("0000:01:00.0")])
            .unwrap();
        assert_eq!(first.newly_reserved.len(), 1);

        let again = alloc
            .reserve(ClusterKind::Hpc, "n1", &[addr("0000:01:00.0"), addr("0000:81:00.0")])
            .unwrap();
        assert_eq!(again.addresses.len(), 2);
        assert_eq!(again.newly_reserved.len(), 1);

        alloc.cancel(&again);
        assert_eq!(alloc.held_by(ClusterKind::Hpc, "n1").len(), 1);
    }

    #[test]
    fn same_name_in_other_cluster_is_a_different_owner() {
        let alloc = GpuResourceAllocator::new();
        alloc.reserve(ClusterKind::Hpc, "node", &[addr("0000:01:00.0")]).unwrap();
        assert!(alloc
            .reserve(ClusterKind::Cloud, "node", &[addr("0000:01:00.0")])
            .is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = GpuResourceAllocator::new();
        assert!(alloc.release(ClusterKind::Hpc, "nobody").is_empty());

        alloc.reserve(ClusterKind::Hpc, "n1", &[addr("0000:01:00.0")]).unwrap();
        assert_eq!(alloc.release(ClusterKind::Hpc, "n1").len(), 1);
        assert!(alloc.release(ClusterKind::Hpc, "n1").is_empty());
        assert!(alloc.owner_of(&addr("0000:01:00.0")).is_none());
    }

    #[test]
    fn availability_check_does_not_bind() {
        let alloc = GpuResourceAllocator::new();
        alloc.check_availability(ClusterKind::Hpc, "n1", &[addr("0000:01:00.0")]).unwrap();
        assert!(alloc.allocations().is_empty());

        alloc.reserve(ClusterKind::Cloud, "w1", &[addr("0000:01:00.0")]).unwrap();
        assert!(alloc
            .check_availability(ClusterKind::Hpc, "n1", &[addr("0000:01:00.0")])
            .is_err());
        assert!(alloc
            .check_availability(ClusterKind::Cloud, "w1", &[addr("0000:01:00.0")])
            .is_ok());
    }
}
