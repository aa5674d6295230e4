mod common;

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_gpu_coordinator::core::lifecycle::CleanupOutcome;
use cluster_gpu_coordinator::core::vm::VmState;
use cluster_gpu_coordinator::errors::{ErrorKind, StateError};
use cluster_gpu_coordinator::state::file_manager::{StateFileManager, StateStore};
use cluster_gpu_coordinator::state::models::{ClusterKind, GpuOwner, PersistedState};
use cluster_gpu_coordinator::{Coordinator, CoordinatorError};

use common::{addr, cluster_config, populated, settings, MockHypervisor, HPC_VM};

#[tokio::test]
async fn reopen_rebuilds_allocations_from_records() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let before = {
        let coordinator =
            populated(dir.path(), hv.clone(), &cluster_config(&["0000:01:00.0"], &[])).await;
        for target in [VmState::Defined, VmState::Running] {
            coordinator
                .request_transition(ClusterKind::Hpc, HPC_VM, target)
                .await
                .unwrap();
        }
        coordinator.snapshot().await
    };

    let coordinator = Coordinator::open(settings(dir.path()), hv).unwrap();
    assert_eq!(coordinator.snapshot().await, before);
    assert_eq!(
        coordinator.list_gpu_allocations().get(&addr("0000:01:00.0")),
        Some(&GpuOwner::new(ClusterKind::Hpc, HPC_VM))
    );
    let status = coordinator.cluster_status(ClusterKind::Hpc).await.unwrap();
    assert_eq!(status.running, 1);
    assert_eq!(status.gpus_assigned, 1);
}

#[tokio::test]
async fn stray_temp_file_does_not_affect_load() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let before = populated(dir.path(), hv.clone(), &cluster_config(&[], &[]))
        .await
        .snapshot()
        .await;

    let stray = dir.path().join(".state.json.abc123.tmp");
    fs::write(&stray, b"CGCSTATE v1 sha256:00 4\n{\"x").unwrap();

    let coordinator = Coordinator::open(settings(dir.path()), hv).unwrap();
    assert_eq!(coordinator.snapshot().await, before);
    assert!(!stray.exists());
}

#[tokio::test]
async fn corrupted_state_is_reported_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    populated(dir.path(), hv.clone(), &cluster_config(&[], &[])).await;

    let path = dir.path().join("state.json");
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0x20;
    fs::write(&path, &bytes).unwrap();

    let err = Coordinator::open(settings(dir.path()), hv.clone())
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Corruption);
    assert!(matches!(
        err,
        CoordinatorError::State(StateError::Corruption { .. })
    ));
    // still the damaged bytes, nothing was overwritten
    assert_eq!(fs::read(&path).unwrap(), bytes);

    let (backup, restored) = Coordinator::restore_latest_backup(&settings(dir.path()).state).unwrap();
    assert!(backup.exists());
    let coordinator = Coordinator::open(settings(dir.path()), hv).unwrap();
    assert_eq!(coordinator.snapshot().await, restored);
}

#[test]
fn newer_schema_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("state.json"),
        b"CGCSTATE v9 sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a 2\n{}",
    )
    .unwrap();

    let err = Coordinator::open(settings(dir.path()), MockHypervisor::new())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        CoordinatorError::State(StateError::Version { found: 9, .. })
    ));
}

#[tokio::test]
async fn missing_state_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::open(settings(dir.path()), MockHypervisor::new()).unwrap();
    assert!(coordinator.snapshot().await.clusters.is_empty());
    assert!(coordinator.list_gpu_allocations().is_empty());
    assert_eq!(
        coordinator
            .get_cluster_snapshot(ClusterKind::Cloud)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

/// In-memory store whose saves can be switched off, or made to fail a
/// fixed number of times.
#[derive(Default)]
struct SwitchableStore {
    broken: Arc<AtomicBool>,
    fail_next: Arc<AtomicUsize>,
    saved: Mutex<Option<PersistedState>>,
}

impl StateStore for SwitchableStore {
    fn load(&self) -> Result<PersistedState, StateError> {
        Err(StateError::NotFound("memory".to_string()))
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let one_off = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if one_off || self.broken.load(Ordering::SeqCst) {
            return Err(StateError::Io(std::io::Error::other("no space left on device")));
        }
        *self.saved.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

#[tokio::test]
async fn failed_save_rolls_back_start() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let store = SwitchableStore::default();
    let broken = store.broken.clone();
    let coordinator =
        Coordinator::with_store(settings(dir.path()), Box::new(store), hv.clone()).unwrap();
    coordinator
        .populate_from_config(&cluster_config(&["0000:01:00.0"], &[]))
        .await
        .unwrap();
    coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Defined)
        .await
        .unwrap();
    let before = coordinator.snapshot().await;

    broken.store(true, Ordering::SeqCst);
    let err = coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Running)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_eq!(coordinator.snapshot().await, before);
    assert!(coordinator.list_gpu_allocations().is_empty());
    assert!(!hv.calls().iter().any(|c| c.starts_with("start")));

    broken.store(false, Ordering::SeqCst);
    coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Running)
        .await
        .unwrap();
    assert_eq!(coordinator.list_gpu_allocations().len(), 1);
}

#[test]
fn backups_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateFileManager::new(dir.path().join("state.json"), 2);
    for _ in 0..5 {
        store.save(&PersistedState::default()).unwrap();
    }
    assert_eq!(store.backups().unwrap().len(), 2);
    assert!(store.latest_backup().unwrap().is_some());
}

/// Coordinator on a [`SwitchableStore`] with the HPC VM running and holding
/// one GPU. Returns the store's switches.
async fn running_on_switchable_store(
    dir: &std::path::Path,
    hv: Arc<MockHypervisor>,
) -> (Coordinator, Arc<AtomicBool>, Arc<AtomicUsize>) {
    let store = SwitchableStore::default();
    let broken = store.broken.clone();
    let fail_next = store.fail_next.clone();
    let coordinator = Coordinator::with_store(settings(dir), Box::new(store), hv).unwrap();
    coordinator
        .populate_from_config(&cluster_config(&["0000:01:00.0"], &[]))
        .await
        .unwrap();
    for target in [VmState::Defined, VmState::Running] {
        coordinator
            .request_transition(ClusterKind::Hpc, HPC_VM, target)
            .await
            .unwrap();
    }
    (coordinator, broken, fail_next)
}

#[tokio::test]
async fn unrecorded_stop_can_be_force_destroyed_after_disk_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let (coordinator, broken, _) = running_on_switchable_store(dir.path(), hv.clone()).await;
    let gpu = addr("0000:01:00.0");

    // the disk goes away while the hypervisor is shutting the VM down
    hv.stall("stop", Duration::from_millis(300));
    let (stopped, ()) = tokio::join!(
        coordinator.request_transition(ClusterKind::Hpc, HPC_VM, VmState::Stopped),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            broken.store(true, Ordering::SeqCst);
        }
    );
    assert_eq!(stopped.unwrap_err().kind(), ErrorKind::Persistence);

    let vm = coordinator
        .get_cluster_snapshot(ClusterKind::Hpc)
        .await
        .unwrap()
        .vm(HPC_VM)
        .cloned()
        .unwrap();
    assert_eq!(vm.state, VmState::Stopping);
    assert_eq!(vm.gpus, vec![gpu.clone()]);
    assert!(coordinator.verify_integrity().await.is_empty());

    broken.store(false, Ordering::SeqCst);
    let err = coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Running)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransition);

    let destroyed = coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Destroyed)
        .await
        .unwrap();
    assert_eq!(destroyed.from, VmState::Stopping);
    assert_eq!(destroyed.cleanup, CleanupOutcome::Complete);
    assert_eq!(destroyed.released, vec![gpu]);
    assert!(coordinator.list_gpu_allocations().is_empty());
    assert!(coordinator.verify_integrity().await.is_empty());
}

#[tokio::test]
async fn single_failed_write_after_stop_parks_vm_in_error() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let (coordinator, _, fail_next) = running_on_switchable_store(dir.path(), hv.clone()).await;
    let gpu = addr("0000:01:00.0");

    hv.stall("stop", Duration::from_millis(300));
    let (stopped, ()) = tokio::join!(
        coordinator.request_transition(ClusterKind::Hpc, HPC_VM, VmState::Stopped),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fail_next.store(1, Ordering::SeqCst);
        }
    );
    assert_eq!(stopped.unwrap_err().kind(), ErrorKind::Persistence);

    let vm = coordinator
        .get_cluster_snapshot(ClusterKind::Hpc)
        .await
        .unwrap()
        .vm(HPC_VM)
        .cloned()
        .unwrap();
    assert_eq!(vm.state, VmState::Error);
    assert_eq!(vm.gpus, vec![gpu.clone()]);
    assert!(vm.last_error.unwrap().contains("not recorded"));
    assert_eq!(
        coordinator.list_gpu_allocations().get(&gpu),
        Some(&GpuOwner::new(ClusterKind::Hpc, HPC_VM))
    );
    assert!(coordinator.verify_integrity().await.is_empty());

    coordinator
        .request_transition(ClusterKind::Hpc, HPC_VM, VmState::Destroyed)
        .await
        .unwrap();
    assert!(coordinator.list_gpu_allocations().is_empty());
}

#[tokio::test]
async fn repopulating_keeps_runtime_state_of_running_vm() {
    let dir = tempfile::tempdir().unwrap();
    let hv = MockHypervisor::new();
    let config = cluster_config(&["0000:01:00.0"], &[]);
    let coordinator = populated(dir.path(), hv, &config).await;
    for target in [VmState::Defined, VmState::Running] {
        coordinator
            .request_transition(ClusterKind::Hpc, HPC_VM, target)
            .await
            .unwrap();
    }

    let mut resized = config.clone();
    if let Some(hpc) = resized.clusters.hpc.as_mut() {
        hpc.compute_nodes[0].cpu_cores = 8;
        hpc.compute_nodes[0].pcie_passthrough = None;
    }
    let report = coordinator.populate_from_config(&resized).await.unwrap();
    assert_eq!(report.updated, vec![HPC_VM.to_string()]);

    let vm = coordinator
        .get_cluster_snapshot(ClusterKind::Hpc)
        .await
        .unwrap()
        .vm(HPC_VM)
        .cloned()
        .unwrap();
    assert_eq!(vm.state, VmState::Running);
    assert_eq!(vm.resources.cpu_cores, 8);
    assert!(vm.declared_gpus.is_empty());
    // the device stays owned until the VM stops
    assert_eq!(vm.gpus, vec![addr("0000:01:00.0")]);
    assert_eq!(coordinator.list_gpu_allocations().len(), 1);
    assert!(coordinator.verify_integrity().await.is_empty());
}
