//! Snapshot operations routed through the selector.
//!
//! Control-plane drivers are asked first, raw disk-image snapshotting after
//! them, following the selector order. Uniqueness, revert safety and chain
//! protection are enforced by the driver that owns the VM; this layer only
//! refuses a revert that the registry already knows would touch a live VM.

use std::sync::Arc;
use tracing::info;

use super::error::{Result, VmError};
use super::instance::{BackendKind, SnapshotInfo};
use super::registry::VmRegistry;

pub struct SnapshotManager {
    registry: Arc<VmRegistry>,
}

impl SnapshotManager {
    pub fn new(registry: Arc<VmRegistry>) -> Self {
        Self { registry }
    }

    pub async fn create(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<BackendKind> {
        validate_snapshot_name(snapshot)?;
        let (_, kind) = self
            .registry
            .selector()
            .run("create snapshot", vm, |b| {
                let description = description.clone();
                async move { b.create_snapshot(vm, snapshot, description).await }
            })
            .await?;
        info!("snapshot {} of {} created on {}", snapshot, vm, kind);
        Ok(kind)
    }

    pub async fn list(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        let (snapshots, _) = self
            .registry
            .selector()
            .run("list snapshots", vm, |b| async move { b.list_snapshots(vm).await })
            .await?;
        Ok(snapshots)
    }

    /// Rejected with `PreconditionFailed` while the VM is active. The VM is
    /// never stopped implicitly.
    pub async fn revert(&self, vm: &str, snapshot: &str) -> Result<BackendKind> {
        if let Ok(state) = self.registry.state(vm).await {
            if state.is_active() {
                return Err(VmError::PreconditionFailed(format!(
                    "vm '{vm}' is {state}; stop it before reverting to '{snapshot}'"
                )));
            }
        }
        let (_, kind) = self
            .registry
            .selector()
            .run("revert snapshot", vm, |b| async move { b.revert_snapshot(vm, snapshot).await })
            .await?;
        info!("{} reverted to {} on {}", vm, snapshot, kind);
        Ok(kind)
    }

    pub async fn delete(&self, vm: &str, snapshot: &str) -> Result<BackendKind> {
        let (_, kind) = self
            .registry
            .selector()
            .run("delete snapshot", vm, |b| async move { b.delete_snapshot(vm, snapshot).await })
            .await?;
        info!("snapshot {} of {} deleted on {}", snapshot, vm, kind);
        Ok(kind)
    }
}

fn validate_snapshot_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VmError::InvalidInput(format!(
            "snapshot name '{name}' may only contain letters, digits, '-', '_' and '.'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::error::ErrorKind;
    use crate::vm::instance::VmState;
    use crate::vm::providers::{Backend, MockBackend};
    use crate::vm::selector::BackendSelector;

    fn manager(backends: Vec<MockBackend>) -> SnapshotManager {
        let backends = backends
            .into_iter()
            .map(|b| Arc::new(b) as Arc<dyn Backend>)
            .collect();
        let registry = VmRegistry::new(BackendSelector::new(backends), "/nonexistent/vms");
        SnapshotManager::new(Arc::new(registry))
    }

    fn qemu() -> MockBackend {
        let mut m = MockBackend::new();
        m.expect_name().return_const("qemu");
        m.expect_kind().return_const(BackendKind::Qemu);
        m.expect_is_available().return_const(true);
        m
    }

    #[tokio::test]
    async fn revert_of_running_vm_never_reaches_the_driver() {
        let mut b = qemu();
        b.expect_state().returning(|_| Ok(VmState::Running));
        b.expect_revert_snapshot().never();

        let err = manager(vec![b]).revert("web", "s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn revert_of_stopped_vm_is_delegated() {
        let mut b = qemu();
        b.expect_state().returning(|_| Ok(VmState::Stopped));
        b.expect_revert_snapshot().times(1).returning(|_, _| Ok(()));

        let kind = manager(vec![b]).revert("web", "s1").await.unwrap();
        assert_eq!(kind, BackendKind::Qemu);
    }

    #[tokio::test]
    async fn bad_snapshot_names_are_rejected_up_front() {
        let mut b = qemu();
        b.expect_create_snapshot().never();
        let err = manager(vec![b]).create("web", "has space", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
