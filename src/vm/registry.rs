//! Name → backing store resolution across every driver plus the filesystem.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{Attempt, ErrorKind, Result, VmError};
use super::instance::{BackendKind, VmInfo, VmState};
use super::layout::{self, VmPaths};
use super::providers::Backend;
use super::selector::BackendSelector;
use crate::utils::vm_metadata::VmMetadata;

/// Backend label for VMs known only from their directory.
pub const FILESYSTEM: &str = "filesystem";

pub struct VmRegistry {
    selector: BackendSelector,
    vm_root: PathBuf,
}

/// Where a name currently lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Owner {
    Backend(BackendKind),
    /// Only the directory convention knows about it.
    Filesystem,
}

impl VmRegistry {
    pub fn new(selector: BackendSelector, vm_root: impl Into<PathBuf>) -> Self {
        Self {
            selector,
            vm_root: vm_root.into(),
        }
    }

    pub fn vm_root(&self) -> &std::path::Path {
        &self.vm_root
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    /// Every VM any available driver reports, merged with directories that
    /// no driver claimed. A name claimed by several drivers is listed once
    /// in the `error` state with the claimants in `error_detail`.
    pub async fn list(&self) -> Result<Vec<VmInfo>> {
        let available = self.selector.available();
        let results = join_all(available.iter().map(|b| b.list())).await;

        let mut claims: BTreeMap<String, Vec<VmInfo>> = BTreeMap::new();
        for (backend, result) in available.iter().zip(results) {
            match result {
                Ok(vms) => {
                    for vm in vms {
                        claims.entry(vm.name.clone()).or_default().push(vm);
                    }
                }
                Err(e) => warn!("{} could not list VMs: {}", backend.name(), e),
            }
        }

        let mut merged: BTreeMap<String, VmInfo> = claims
            .into_iter()
            .map(|(name, mut infos)| {
                let info = if infos.len() == 1 {
                    infos.remove(0)
                } else {
                    conflict_entry(&name, &infos)
                };
                (name, info)
            })
            .collect();

        for name in layout::scan(&self.vm_root) {
            if merged.contains_key(&name) {
                continue;
            }
            let paths = VmPaths::new(&self.vm_root, &name);
            if paths.is_orphan_disk() {
                debug!("{} holds only a kept disk; not listing it", name);
                continue;
            }
            merged.insert(name.clone(), filesystem_entry(&paths));
        }

        Ok(merged.into_values().collect())
    }

    /// The single driver that owns `name`, with its reported state.
    ///
    /// All available drivers are asked. Two positive answers are a
    /// `Conflict`. A driver that recognises the VM but fails is reported as
    /// is, never masked by another driver's `NotFound`. A directory no driver
    /// claims resolves to [`Owner::Filesystem`] in the `unknown` state.
    pub async fn resolve(&self, name: &str) -> Result<(VmState, Owner)> {
        let available = self.selector.available();
        let results = join_all(available.iter().map(|b| b.state(name))).await;

        let mut attempts: Vec<Attempt> = self
            .selector
            .backends()
            .iter()
            .filter(|b| !b.is_available())
            .map(|b| Attempt {
                backend: b.name().to_string(),
                kind: ErrorKind::Unavailable,
                reason: "tooling not installed".to_string(),
            })
            .collect();
        let mut owners: Vec<(BackendKind, VmState)> = Vec::new();
        let mut hard_failure = None;

        for (backend, result) in available.iter().zip(results) {
            match result {
                Ok(state) => owners.push((backend.kind(), state)),
                Err(e) if e.allows_fallback() => attempts.push(Attempt {
                    backend: backend.name().to_string(),
                    kind: e.kind(),
                    reason: e.to_string(),
                }),
                Err(e) => {
                    if hard_failure.is_none() {
                        hard_failure = Some(e);
                    }
                }
            }
        }

        match owners.as_slice() {
            [(kind, state)] if hard_failure.is_none() => Ok((*state, Owner::Backend(*kind))),
            [] => {
                if let Some(e) = hard_failure {
                    return Err(e);
                }
                let paths = VmPaths::new(&self.vm_root, name);
                if paths.has_vm_markers() && !paths.is_orphan_disk() {
                    return Ok((VmState::Unknown, Owner::Filesystem));
                }
                Err(VmError::Exhausted {
                    operation: "resolve".to_string(),
                    vm: name.to_string(),
                    attempts,
                })
            }
            _ => Err(VmError::Conflict(format!(
                "vm '{name}' is claimed by several backends: {}",
                owners
                    .iter()
                    .map(|(k, _)| k.as_str())
                    .chain(hard_failure.iter().map(|_| "a failing backend"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    pub async fn state(&self, name: &str) -> Result<VmState> {
        self.resolve(name).await.map(|(state, _)| state)
    }

    pub async fn info(&self, name: &str) -> Result<VmInfo> {
        match self.resolve(name).await? {
            (_, Owner::Backend(kind)) => self.backend(kind)?.info(name).await,
            (_, Owner::Filesystem) => Ok(filesystem_entry(&VmPaths::new(&self.vm_root, name))),
        }
    }

    /// Refuse a name that any driver or a VM directory already holds. A
    /// directory holding only a kept disk may be reused.
    pub async fn ensure_absent(&self, name: &str) -> Result<()> {
        match self.resolve(name).await {
            Ok((_, Owner::Backend(kind))) => Err(VmError::Conflict(format!(
                "vm '{name}' already exists ({kind})"
            ))),
            Ok((_, Owner::Filesystem)) => Err(VmError::Conflict(format!(
                "vm '{name}' already exists in {}",
                self.vm_root.join(name).display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::Unavailable => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn backend(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.selector
            .backends()
            .iter()
            .find(|b| b.kind() == kind)
            .cloned()
            .ok_or_else(|| VmError::unavailable(kind.as_str(), "backend is not enabled"))
    }
}

fn conflict_entry(name: &str, infos: &[VmInfo]) -> VmInfo {
    let claimants: Vec<&str> = infos.iter().map(|i| i.backend.as_str()).collect();
    let mut info = VmInfo::new(name, claimants.join("+"), VmState::Error);
    info.error_detail = Some(format!(
        "name claimed by several backends ({}); resolve manually",
        claimants.join(", ")
    ));
    info
}

fn filesystem_entry(paths: &VmPaths) -> VmInfo {
    let mut info = VmInfo::new(&paths.name, FILESYSTEM, VmState::Unknown);
    info.path = Some(paths.dir.clone());
    if let Ok(Some(meta)) = VmMetadata::load(&paths.dir) {
        info.ram = Some(meta.config.ram.clone());
        info.cpus = Some(meta.config.cpus);
        info.disk_size = Some(meta.config.disk_size.clone());
        info.os_type = Some(meta.config.os_type.clone());
        info.created_at = Some(meta.created_at);
        info.last_started = meta.last_started;
        info.error_detail = Some(format!("{} backend not available", meta.backend));
    }
    info
}
