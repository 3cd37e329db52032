//! Ordered, failure-aware choice among backend drivers.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{Attempt, ErrorKind, Result, VmError};
use super::instance::BackendKind;
use super::providers::Backend;

/// Tries drivers in a fixed order until one accepts the operation.
///
/// The order never changes with history. A driver whose `is_available()` is
/// false is recorded as an attempt and never invoked. `NotFound` and
/// `Unavailable` move on to the next candidate; any other failure comes from
/// a driver that owns the VM and is returned as is.
#[derive(Clone)]
pub struct BackendSelector {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendSelector {
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Self {
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    pub fn available(&self) -> Vec<Arc<dyn Backend>> {
        self.backends.iter().filter(|b| b.is_available()).cloned().collect()
    }

    /// The driver `auto` would try first.
    pub fn preferred(&self) -> Option<BackendKind> {
        self.backends.iter().find(|b| b.is_available()).map(|b| b.kind())
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, vm: &str, mut call: F) -> Result<(T, BackendKind)>
    where
        F: FnMut(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = Vec::new();
        for backend in &self.backends {
            if !backend.is_available() {
                debug!("{}: skipping {} (not available)", operation, backend.name());
                attempts.push(Attempt {
                    backend: backend.name().to_string(),
                    kind: ErrorKind::Unavailable,
                    reason: "tooling not installed".to_string(),
                });
                continue;
            }

            match call(backend.clone()).await {
                Ok(value) => {
                    debug!("{} '{}' handled by {}", operation, vm, backend.name());
                    return Ok((value, backend.kind()));
                }
                Err(e) if e.allows_fallback() => {
                    debug!("{} '{}' not handled by {}: {}", operation, vm, backend.name(), e);
                    attempts.push(Attempt {
                        backend: backend.name().to_string(),
                        kind: e.kind(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        if attempts.iter().all(|a| a.kind == ErrorKind::Unavailable) {
            warn!("{} '{}': no backend available", operation, vm);
        }
        Err(VmError::Exhausted {
            operation: operation.to_string(),
            vm: vm.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::providers::MockBackend;

    fn mock(kind: BackendKind, available: bool) -> MockBackend {
        let mut m = MockBackend::new();
        m.expect_name().return_const(kind.as_str());
        m.expect_kind().return_const(kind);
        m.expect_is_available().return_const(available);
        m
    }

    #[tokio::test]
    async fn unavailable_driver_is_never_invoked() {
        let mut libvirt = mock(BackendKind::Libvirt, false);
        libvirt.expect_start().never();
        let mut qemu = mock(BackendKind::Qemu, true);
        qemu.expect_start().times(1).returning(|_| Ok(()));

        let selector = BackendSelector::new(vec![Arc::new(libvirt), Arc::new(qemu)]);
        let ((), kind) = selector
            .run("start", "web", |b| async move { b.start("web").await })
            .await
            .unwrap();
        assert_eq!(kind, BackendKind::Qemu);
    }

    #[tokio::test]
    async fn not_found_falls_through_in_order() {
        let mut libvirt = mock(BackendKind::Libvirt, true);
        libvirt
            .expect_stop()
            .times(1)
            .returning(|name, _| Err(VmError::not_found("libvirt", name)));
        let mut qemu = mock(BackendKind::Qemu, true);
        qemu.expect_stop().times(1).returning(|_, _| Ok(()));
        let mut vbox = mock(BackendKind::VirtualBox, true);
        vbox.expect_stop().never();

        let selector = BackendSelector::new(vec![Arc::new(libvirt), Arc::new(qemu), Arc::new(vbox)]);
        let (_, kind) = selector
            .run("stop", "web", |b| async move { b.stop("web", false).await })
            .await
            .unwrap();
        assert_eq!(kind, BackendKind::Qemu);
    }

    #[tokio::test]
    async fn operation_failure_on_owner_is_terminal() {
        let mut libvirt = mock(BackendKind::Libvirt, true);
        libvirt
            .expect_start()
            .returning(|_| Err(VmError::failed("libvirt", "virsh start", Some(1), "domain is locked")));
        let mut qemu = mock(BackendKind::Qemu, true);
        qemu.expect_start().never();

        let selector = BackendSelector::new(vec![Arc::new(libvirt), Arc::new(qemu)]);
        let err = selector
            .run("start", "web", |b| async move { b.start("web").await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert!(err.attempts().is_empty());
    }

    #[tokio::test]
    async fn conflict_is_never_retried() {
        let mut libvirt = mock(BackendKind::Libvirt, true);
        libvirt
            .expect_create_snapshot()
            .returning(|_, _, _| Err(VmError::Conflict("snapshot exists".into())));
        let mut qemu = mock(BackendKind::Qemu, true);
        qemu.expect_create_snapshot().never();

        let selector = BackendSelector::new(vec![Arc::new(libvirt), Arc::new(qemu)]);
        let err = selector
            .run("snapshot", "web", |b| async move { b.create_snapshot("web", "s1", None).await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn exhaustion_lists_every_driver() {
        let mut libvirt = mock(BackendKind::Libvirt, true);
        libvirt
            .expect_info()
            .returning(|name| Err(VmError::not_found("libvirt", name)));
        let qemu = mock(BackendKind::Qemu, false);

        let selector = BackendSelector::new(vec![Arc::new(libvirt), Arc::new(qemu)]);
        let err = selector
            .run("info", "ghost", |b| async move { b.info("ghost").await })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        let backends: Vec<_> = err.attempts().iter().map(|a| a.backend.as_str()).collect();
        assert_eq!(backends, vec!["libvirt", "qemu"]);
        let msg = err.to_string();
        assert!(msg.contains("libvirt") && msg.contains("qemu"));
    }

    #[tokio::test]
    async fn nothing_available_is_unavailable() {
        let selector = BackendSelector::new(vec![
            Arc::new(mock(BackendKind::Libvirt, false)),
            Arc::new(mock(BackendKind::Qemu, false)),
        ]);
        let err = selector
            .run("list", "*", |b| async move { b.list().await })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(selector.preferred(), None);
    }
}
